use async_trait::async_trait;

use dockership_core::{WebhookPayload, WebhookSink};
use dockership_types::{DockershipError, Result};

/// Posts deploy payloads as JSON.
#[derive(Debug, Clone, Default)]
pub struct HttpWebhook {
    client: reqwest::Client,
}

impl HttpWebhook {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WebhookSink for HttpWebhook {
    async fn post(&self, url: &str, payload: &WebhookPayload) -> Result<()> {
        let resp = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| DockershipError::Other(format!("webhook {url}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DockershipError::Other(format!(
                "webhook {url} answered {status}: {}",
                body.trim()
            )));
        }
        Ok(())
    }
}
