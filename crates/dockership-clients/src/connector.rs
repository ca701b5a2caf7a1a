use std::sync::Arc;

use dockership_core::memory::MemoryConnector;
use dockership_core::{Connector, Engine, KeyValueStore, SourceProvider, WebhookSink};
use dockership_types::{Environment, Project, Result};

use crate::docker::DockerHttpEngine;
use crate::etcd::EtcdClient;
use crate::github::GithubClient;
use crate::webhook::HttpWebhook;

// ---------------------------------------------------------------------------
// HttpConnector
// ---------------------------------------------------------------------------

/// Connects every collaborator over HTTP, sharing one connection pool.
#[derive(Debug, Clone, Default)]
pub struct HttpConnector {
    client: reqwest::Client,
    github_url: Option<String>,
}

impl HttpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            github_url: None,
        }
    }

    /// Point source lookups at a GitHub Enterprise (or test) API.
    pub fn with_github_url(mut self, url: impl Into<String>) -> Self {
        self.github_url = Some(url.into());
        self
    }
}

impl Connector for HttpConnector {
    fn source(&self, project: &Project) -> Result<Arc<dyn SourceProvider>> {
        let mut github = GithubClient::with_client(self.client.clone(), project.github_token.clone());
        if let Some(url) = &self.github_url {
            github = github.with_base_url(url.clone());
        }
        Ok(Arc::new(github))
    }

    fn engine(&self, environment: &Environment, endpoint: &str) -> Result<Arc<dyn Engine>> {
        let cert_path = environment.cert_path.as_deref();
        let engine = if DockerHttpEngine::needs_dedicated_client(endpoint, cert_path) {
            DockerHttpEngine::connect(endpoint, cert_path)?
        } else {
            DockerHttpEngine::with_client(self.client.clone(), endpoint)?
        };
        Ok(Arc::new(engine))
    }

    fn key_value_store(&self, environment: &Environment) -> Option<Arc<dyn KeyValueStore>> {
        if environment.etcd_servers.is_empty() {
            return None;
        }
        Some(Arc::new(EtcdClient::with_client(
            self.client.clone(),
            environment.etcd_servers.clone(),
        )))
    }

    fn webhook(&self) -> Option<Arc<dyn WebhookSink>> {
        Some(Arc::new(HttpWebhook::new(self.client.clone())))
    }
}

// ---------------------------------------------------------------------------
// DryRunConnector
// ---------------------------------------------------------------------------

/// Reads sources and key-value stores for real but deploys onto in-memory
/// engines. No webhook is ever posted.
#[derive(Clone)]
pub struct DryRunConnector {
    http: HttpConnector,
    engines: Arc<MemoryConnector>,
}

impl DryRunConnector {
    pub fn new(http: HttpConnector) -> Self {
        Self {
            http,
            engines: Arc::new(MemoryConnector::default()),
        }
    }
}

impl Connector for DryRunConnector {
    fn source(&self, project: &Project) -> Result<Arc<dyn SourceProvider>> {
        self.http.source(project)
    }

    fn engine(&self, environment: &Environment, endpoint: &str) -> Result<Arc<dyn Engine>> {
        self.engines.engine(environment, endpoint)
    }

    fn key_value_store(&self, environment: &Environment) -> Option<Arc<dyn KeyValueStore>> {
        self.http.key_value_store(environment)
    }

    fn webhook(&self) -> Option<Arc<dyn WebhookSink>> {
        None
    }
}
