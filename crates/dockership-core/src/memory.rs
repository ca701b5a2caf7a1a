//! In-memory implementations of every capability trait.
//!
//! They back the test suite and the CLI's `--dry-run` mode: state lives in
//! the process, nothing touches a real engine, repository or store.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use dockership_types::{
    Commit, Container, DockershipError, Environment, Image, ImageId, PortMapping, Project, Result,
    Vcs,
};

use crate::connector::{Connector, WebhookPayload, WebhookSink};
use crate::dockerfile::KeyValueStore;
use crate::engine::{ContainerSpec, Engine, HostConfig, OutputSink};
use crate::source::SourceProvider;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// MemoryEngine
// ---------------------------------------------------------------------------

/// What a [`MemoryEngine`] was asked to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecord {
    pub tag: ImageId,
    pub dockerfile: String,
    /// Every other file name in the build context.
    pub files: Vec<String>,
    pub no_cache: bool,
}

#[derive(Debug, Default)]
struct EngineState {
    images: Vec<Image>,
    containers: Vec<Container>,
    builds: Vec<BuildRecord>,
    starts: HashMap<String, usize>,
    failing: HashSet<String>,
    sequence: u64,
}

impl EngineState {
    fn next_id(&mut self) -> (String, i64) {
        self.sequence += 1;
        let id = format!("{:012x}{:052x}", self.sequence, self.sequence);
        (id, 1_000 + self.sequence as i64)
    }

    fn check(&self, operation: &str) -> Result<()> {
        if self.failing.contains(operation) {
            return Err(DockershipError::engine(operation, "injected failure"));
        }
        Ok(())
    }

    fn container_mut(&mut self, id: &str) -> Result<&mut Container> {
        self.containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| DockershipError::engine("inspect", format!("no such container: {id}")))
    }
}

/// An engine endpoint whose images and containers live in memory.
///
/// Operation names usable with [`MemoryEngine::fail_on`]: `list_containers`,
/// `list_images`, `build`, `create`, `start`, `kill`, `remove_container`,
/// `remove_image`.
#[derive(Debug)]
pub struct MemoryEngine {
    endpoint: String,
    state: Mutex<EngineState>,
}

impl MemoryEngine {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Make every later call of `operation` fail.
    pub fn fail_on(&self, operation: &str) {
        lock(&self.state).failing.insert(operation.to_string());
    }

    pub fn recover(&self, operation: &str) {
        lock(&self.state).failing.remove(operation);
    }

    /// Seed an image; returns its id.
    pub fn add_image(&self, tag: &str, created: i64) -> String {
        let mut state = lock(&self.state);
        let (id, _) = state.next_id();
        state.images.push(Image {
            endpoint: self.endpoint.clone(),
            id: id.clone(),
            repo_tags: vec![tag.to_string()],
            created,
        });
        id
    }

    /// Seed a container named `/name`; returns its id.
    pub fn add_container(&self, name: &str, image: &str, running: bool) -> String {
        let mut state = lock(&self.state);
        let (id, created) = state.next_id();
        state.containers.push(Container {
            endpoint: self.endpoint.clone(),
            id: id.clone(),
            image: ImageId::new(image),
            names: vec![format!("/{name}")],
            status: if running { running_status() } else { exited_status() },
            created,
            ports: Vec::new(),
        });
        id
    }

    pub fn images(&self) -> Vec<Image> {
        lock(&self.state).images.clone()
    }

    pub fn containers(&self) -> Vec<Container> {
        lock(&self.state).containers.clone()
    }

    pub fn builds(&self) -> Vec<BuildRecord> {
        lock(&self.state).builds.clone()
    }

    /// How many times `id` was started through the engine.
    pub fn start_count(&self, id: &str) -> usize {
        lock(&self.state).starts.get(id).copied().unwrap_or(0)
    }
}

fn running_status() -> String {
    "Up Less than a second".to_string()
}

fn exited_status() -> String {
    "Exited (137) Less than a second ago".to_string()
}

fn read_context(context: &[u8]) -> std::io::Result<(String, Vec<String>)> {
    let mut archive = tar::Archive::new(context);
    let mut dockerfile = String::new();
    let mut files = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.display().to_string();
        if name == "Dockerfile" {
            entry.read_to_string(&mut dockerfile)?;
        } else {
            files.push(name);
        }
    }
    Ok((dockerfile, files))
}

fn port_mappings(host_config: &HostConfig) -> Vec<PortMapping> {
    let mut ports = Vec::new();
    for (key, bindings) in &host_config.port_bindings {
        let (port, kind) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
        let private_port = port.parse().unwrap_or(0);
        for binding in bindings {
            ports.push(PortMapping {
                ip: binding.host_ip.clone(),
                private_port,
                public_port: binding.host_port.parse().unwrap_or(0),
                kind: kind.to_string(),
            });
        }
    }
    ports
}

#[async_trait]
impl Engine for MemoryEngine {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn list_containers(&self) -> Result<Vec<Container>> {
        let state = lock(&self.state);
        state.check("list_containers")?;
        Ok(state.containers.clone())
    }

    async fn list_images(&self) -> Result<Vec<Image>> {
        let state = lock(&self.state);
        state.check("list_images")?;
        Ok(state.images.clone())
    }

    async fn build_image(
        &self,
        tag: &ImageId,
        context: Vec<u8>,
        no_cache: bool,
        output: &OutputSink,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        state.check("build")?;

        let (dockerfile, files) =
            read_context(&context).map_err(|e| DockershipError::engine("build", e))?;
        output.write(&self.endpoint, format!("Step 1/1 : building {tag}"));

        let (id, created) = state.next_id();
        state.images.retain(|i| !i.repo_tags.iter().any(|t| t == tag.as_str()));
        state.images.push(Image {
            endpoint: self.endpoint.clone(),
            id: id.clone(),
            repo_tags: vec![tag.to_string()],
            created,
        });
        state.builds.push(BuildRecord {
            tag: tag.clone(),
            dockerfile,
            files,
            no_cache,
        });

        output.write(&self.endpoint, format!("Successfully built {}", &id[..12]));
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = lock(&self.state);
        state.check("create")?;

        let name = format!("/{}", spec.name);
        if state.containers.iter().any(|c| c.names.contains(&name)) {
            return Err(DockershipError::engine(
                "create",
                format!("container name {name} is already in use"),
            ));
        }
        if !state
            .images
            .iter()
            .any(|i| i.repo_tags.iter().any(|t| t == spec.image.as_str()))
        {
            return Err(DockershipError::engine(
                "create",
                format!("no such image: {}", spec.image),
            ));
        }

        let (id, created) = state.next_id();
        state.containers.push(Container {
            endpoint: self.endpoint.clone(),
            id: id.clone(),
            image: spec.image.clone(),
            names: vec![name],
            status: "Created".to_string(),
            created,
            ports: Vec::new(),
        });
        Ok(id)
    }

    async fn start_container(&self, id: &str, host_config: &HostConfig) -> Result<()> {
        let mut state = lock(&self.state);
        state.check("start")?;

        let container = state.container_mut(id)?;
        container.status = running_status();
        container.ports = port_mappings(host_config);
        *state.starts.entry(id.to_string()).or_default() += 1;
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.check("kill")?;

        let container = state.container_mut(id)?;
        if !container.is_running() {
            return Err(DockershipError::engine(
                "kill",
                format!("container {id} is not running"),
            ));
        }
        container.status = exited_status();
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.check("remove_container")?;

        if state.container_mut(id)?.is_running() {
            return Err(DockershipError::engine(
                "remove_container",
                format!("container {id} is running"),
            ));
        }
        state.containers.retain(|c| c.id != id);
        Ok(())
    }

    async fn remove_image(&self, id: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.check("remove_image")?;

        let image = state
            .images
            .iter()
            .find(|i| i.id == id)
            .ok_or_else(|| DockershipError::engine("remove_image", format!("no such image: {id}")))?;

        // Stopped containers pin their image too.
        let user = state.containers.iter().find(|c| {
            c.image.as_str() == image.id || image.repo_tags.iter().any(|t| t == c.image.as_str())
        });
        if let Some(container) = user {
            return Err(DockershipError::engine(
                "remove_image",
                format!(
                    "409: conflict: unable to delete {id}, image is being used by container {}",
                    container.short_id()
                ),
            ));
        }

        state.images.retain(|i| i.id != id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// A source provider over fixed commits and files.
#[derive(Debug, Default)]
pub struct MemorySource {
    commits: Mutex<HashMap<Vcs, Commit>>,
    files: Mutex<HashMap<(Vcs, String, String), Vec<u8>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_commit(self, vcs: impl Into<Vcs>, commit: impl Into<Commit>) -> Self {
        self.set_commit(vcs, commit);
        self
    }

    pub fn with_file(
        self,
        vcs: impl Into<Vcs>,
        reference: &str,
        path: &str,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        self.set_file(vcs, reference, path, content);
        self
    }

    /// Move the head of `vcs` to `commit`.
    pub fn set_commit(&self, vcs: impl Into<Vcs>, commit: impl Into<Commit>) {
        lock(&self.commits).insert(vcs.into(), commit.into());
    }

    pub fn set_file(
        &self,
        vcs: impl Into<Vcs>,
        reference: &str,
        path: &str,
        content: impl Into<Vec<u8>>,
    ) {
        lock(&self.files).insert(
            (vcs.into(), reference.to_string(), path.to_string()),
            content.into(),
        );
    }
}

#[async_trait]
impl SourceProvider for MemorySource {
    async fn last_commit(&self, vcs: &Vcs) -> Result<Commit> {
        lock(&self.commits)
            .get(vcs)
            .cloned()
            .ok_or_else(|| DockershipError::Source {
                repository: vcs.to_string(),
                message: "branch not found".into(),
            })
    }

    async fn file_content(&self, vcs: &Vcs, reference: &str, path: &str) -> Result<Vec<u8>> {
        lock(&self.files)
            .get(&(vcs.clone(), reference.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| DockershipError::FileNotFound {
                repository: vcs.to_string(),
                path: path.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MemoryStore {
    values: HashMap<String, String>,
    directories: HashSet<String>,
    reachable: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
            directories: HashSet::new(),
            reachable: true,
        }
    }

    pub fn with_value(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_directory(mut self, key: &str) -> Self {
        self.directories.insert(key.to_string());
        self
    }

    /// Every lookup fails as if no server answered.
    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<String> {
        if !self.reachable {
            return Err(DockershipError::StoreUnreachable("memory".into()));
        }
        if self.directories.contains(key) {
            return Err(DockershipError::KeyIsDirectory(key.to_string()));
        }
        self.values
            .get(key)
            .cloned()
            .ok_or_else(|| DockershipError::KeyNotFound(key.to_string()))
    }
}

// ---------------------------------------------------------------------------
// MemoryWebhook
// ---------------------------------------------------------------------------

/// Records every payload posted to it.
#[derive(Debug, Default)]
pub struct MemoryWebhook {
    calls: Mutex<Vec<(String, WebhookPayload)>>,
    posted: Notify,
}

impl MemoryWebhook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, WebhookPayload)> {
        lock(&self.calls).clone()
    }

    /// Wait until at least `count` payloads have been posted.
    pub async fn wait_for(&self, count: usize) -> Vec<(String, WebhookPayload)> {
        loop {
            let posted = self.posted.notified();
            {
                let calls = lock(&self.calls);
                if calls.len() >= count {
                    return calls.clone();
                }
            }
            posted.await;
        }
    }
}

#[async_trait]
impl WebhookSink for MemoryWebhook {
    async fn post(&self, url: &str, payload: &WebhookPayload) -> Result<()> {
        lock(&self.calls).push((url.to_string(), payload.clone()));
        self.posted.notify_waiters();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryConnector
// ---------------------------------------------------------------------------

/// Hands out one [`MemoryEngine`] per endpoint, created on first use.
pub struct MemoryConnector {
    source: Arc<dyn SourceProvider>,
    engines: Mutex<HashMap<String, Arc<MemoryEngine>>>,
    stores: HashMap<String, Arc<dyn KeyValueStore>>,
    webhook: Option<Arc<dyn WebhookSink>>,
}

impl MemoryConnector {
    pub fn new(source: Arc<dyn SourceProvider>) -> Self {
        Self {
            source,
            engines: Mutex::new(HashMap::new()),
            stores: HashMap::new(),
            webhook: None,
        }
    }

    /// Key-value store used for the named environment.
    pub fn with_store(mut self, environment: &str, store: Arc<dyn KeyValueStore>) -> Self {
        self.stores.insert(environment.to_string(), store);
        self
    }

    pub fn with_webhook(mut self, webhook: Arc<dyn WebhookSink>) -> Self {
        self.webhook = Some(webhook);
        self
    }

    /// The engine behind `endpoint`, created empty if unseen.
    pub fn engine_for(&self, endpoint: &str) -> Arc<MemoryEngine> {
        lock(&self.engines)
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(MemoryEngine::new(endpoint)))
            .clone()
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new(Arc::new(MemorySource::new()))
    }
}

impl Connector for MemoryConnector {
    fn source(&self, _project: &Project) -> Result<Arc<dyn SourceProvider>> {
        Ok(self.source.clone())
    }

    fn engine(&self, _environment: &Environment, endpoint: &str) -> Result<Arc<dyn Engine>> {
        let engine: Arc<dyn Engine> = self.engine_for(endpoint);
        Ok(engine)
    }

    fn key_value_store(&self, environment: &Environment) -> Option<Arc<dyn KeyValueStore>> {
        self.stores.get(&environment.name).cloned()
    }

    fn webhook(&self) -> Option<Arc<dyn WebhookSink>> {
        self.webhook.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn engine_enforces_container_lifecycle() {
        let engine = MemoryEngine::new("mem://a");
        engine.add_image("web:r1", 1);
        let spec = ContainerSpec {
            name: "web".into(),
            image: ImageId::new("web:r1"),
            volumes: vec![],
            host_config: HostConfig::default(),
        };

        let id = engine.create_container(&spec).await.unwrap();
        assert!(engine.create_container(&spec).await.is_err());
        assert!(engine.kill_container(&id).await.is_err());

        engine.start_container(&id, &HostConfig::default()).await.unwrap();
        assert!(engine.remove_container(&id).await.is_err());

        engine.kill_container(&id).await.unwrap();
        engine.remove_container(&id).await.unwrap();
        assert!(engine.containers().is_empty());
        assert_eq!(engine.start_count(&id), 1);
    }

    #[tokio::test]
    async fn create_requires_existing_image() {
        let engine = MemoryEngine::new("mem://a");
        let spec = ContainerSpec {
            name: "web".into(),
            image: ImageId::new("web:missing"),
            volumes: vec![],
            host_config: HostConfig::default(),
        };
        assert!(engine.create_container(&spec).await.is_err());
    }

    #[tokio::test]
    async fn image_used_by_any_container_is_not_removed() {
        let engine = MemoryEngine::new("mem://a");
        let used = engine.add_image("web:r1", 1);
        let stopped = engine.add_image("web:r2", 2);
        let free = engine.add_image("web:r3", 3);
        engine.add_container("web", "web:r1", true);
        engine.add_container("web-old", "web:r2", false);

        let err = engine.remove_image(&used).await.unwrap_err();
        assert!(err.to_string().contains("409"));
        assert!(engine.remove_image(&stopped).await.is_err());
        engine.remove_image(&free).await.unwrap();
        assert_eq!(engine.images().len(), 2);
    }

    #[tokio::test]
    async fn injected_failures_can_be_cleared() {
        let engine = MemoryEngine::new("mem://a");
        engine.fail_on("list_images");
        assert!(engine.list_images().await.is_err());
        engine.recover("list_images");
        assert!(engine.list_images().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn connector_reuses_engines_per_endpoint() {
        let connector = MemoryConnector::default();
        let live = Environment::new("live", vec!["mem://a".into()]);
        let first = connector.engine(&live, "mem://a").unwrap();
        connector.engine_for("mem://a").add_image("web:r1", 1);
        assert_eq!(first.list_images().await.unwrap().len(), 1);
        assert!(connector.engine_for("mem://b").images().is_empty());
    }

    #[tokio::test]
    async fn webhook_wait_returns_once_posted() {
        let webhook = Arc::new(MemoryWebhook::new());
        let poster = webhook.clone();
        tokio::spawn(async move {
            let payload = WebhookPayload {
                project: "web".into(),
                repository: "git@github.com:acme/web.git".into(),
                environment: "live".into(),
                previous_revision: None,
                current_revision: None,
                errors: vec![],
            };
            poster.post("http://hook", &payload).await.unwrap();
        });

        let calls = tokio::time::timeout(std::time::Duration::from_secs(5), webhook.wait_for(1))
            .await
            .unwrap();
        assert_eq!(calls[0].0, "http://hook");
    }
}
