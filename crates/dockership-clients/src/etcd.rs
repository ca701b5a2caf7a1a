use async_trait::async_trait;
use serde::Deserialize;

use dockership_core::KeyValueStore;
use dockership_types::{DockershipError, Result};

#[derive(Debug, Deserialize)]
struct KeysResponse {
    node: Node,
}

#[derive(Debug, Deserialize)]
struct Node {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
}

/// Read-only client for the etcd v2 keys API. Machines are tried in order
/// until one answers.
#[derive(Debug, Clone)]
pub struct EtcdClient {
    client: reqwest::Client,
    machines: Vec<String>,
}

impl EtcdClient {
    pub fn new(machines: Vec<String>) -> Self {
        Self::with_client(reqwest::Client::new(), machines)
    }

    pub fn with_client(client: reqwest::Client, machines: Vec<String>) -> Self {
        let machines = machines
            .into_iter()
            .map(|m| m.trim_end_matches('/').to_string())
            .collect();
        Self { client, machines }
    }

    pub fn machines(&self) -> &[String] {
        &self.machines
    }

    async fn get_from(&self, machine: &str, key: &str) -> std::result::Result<Result<String>, String> {
        let url = format!("{machine}/v2/keys/{}", key.trim_start_matches('/'));
        let resp = self.client.get(&url).send().await.map_err(|e| e.to_string())?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Err(DockershipError::KeyNotFound(key.to_string())));
        }
        if !status.is_success() {
            return Err(format!("{machine} answered {status}"));
        }

        let body = resp.text().await.map_err(|e| e.to_string())?;
        let parsed: KeysResponse =
            serde_json::from_str(&body).map_err(|e| format!("{machine}: invalid response: {e}"))?;

        if parsed.node.dir {
            return Ok(Err(DockershipError::KeyIsDirectory(key.to_string())));
        }
        Ok(Ok(parsed.node.value.unwrap_or_default()))
    }
}

#[async_trait]
impl KeyValueStore for EtcdClient {
    async fn get(&self, key: &str) -> Result<String> {
        let mut failures = Vec::new();
        for machine in &self.machines {
            match self.get_from(machine, key).await {
                Ok(answer) => return answer,
                Err(reason) => {
                    tracing::debug!(machine, key, %reason, "etcd machine failed");
                    failures.push(reason);
                }
            }
        }

        if failures.is_empty() {
            failures.push("no machines configured".into());
        }
        Err(DockershipError::StoreUnreachable(failures.join("; ")))
    }
}
