//! Wiring from configuration to live collaborators, and the webhook contract.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use dockership_types::{Environment, Project, Result};

use crate::dockerfile::KeyValueStore;
use crate::engine::Engine;
use crate::source::SourceProvider;

/// Hands out the collaborators a deploy needs.
pub trait Connector: Send + Sync {
    /// Source provider for a project (tokens are per project).
    fn source(&self, project: &Project) -> Result<Arc<dyn SourceProvider>>;

    /// Engine for one endpoint of `environment`; TLS material comes from the
    /// environment.
    fn engine(&self, environment: &Environment, endpoint: &str) -> Result<Arc<dyn Engine>>;

    /// `None` when the environment declares no key-value servers.
    fn key_value_store(&self, environment: &Environment) -> Option<Arc<dyn KeyValueStore>>;

    fn webhook(&self) -> Option<Arc<dyn WebhookSink>>;
}

/// JSON body posted to a project's webhook after every deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub project: String,
    pub repository: String,
    pub environment: String,
    pub previous_revision: Option<String>,
    pub current_revision: Option<String>,
    pub errors: Vec<String>,
}

#[async_trait]
pub trait WebhookSink: Send + Sync {
    async fn post(&self, url: &str, payload: &WebhookPayload) -> Result<()>;
}
