//! TOML configuration loading.
//!
//! ```toml
//! [global]
//! github_token = "..."
//!
//! [environments.live]
//! docker_endpoints = ["tcp://10.0.0.1:2375", "tcp://10.0.0.2:2375"]
//! etcd_servers = ["http://10.0.0.1:4001"]
//! cert_path = "/etc/dockership/certs/live"
//!
//! [projects.web]
//! repository = "git@github.com:acme/web.git!production"
//! environments = ["live"]
//! ports = ["0.0.0.0:80:8080/tcp"]
//! links = ["db:database"]
//! ```
//!
//! Every syntactic check happens here so a loaded [`Catalog`] never holds a
//! malformed port, restart policy, link or repository reference.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use dockership_types::{
    DockershipError, Environment, Link, LinkDefinition, LinkTarget, PortBinding, Project, Result,
    RestartPolicy, Vcs, DEFAULT_DOCKERFILE, DEFAULT_HISTORY,
};

use crate::catalog::Catalog;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub global: GlobalConfig,
    pub environments: BTreeMap<String, EnvironmentConfig>,
    pub projects: BTreeMap<String, ProjectConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub github_token: Option<String>,
    pub use_short_revisions: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            github_token: None,
            use_short_revisions: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub docker_endpoints: Vec<String>,
    pub etcd_servers: Vec<String>,
    pub cert_path: Option<PathBuf>,
}

/// A project section. Unset options fall back to `[global]` or the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub repository: String,
    pub related_repositories: Vec<String>,
    pub dockerfile: Option<String>,
    pub github_token: Option<String>,
    pub history: Option<i32>,
    pub use_short_revisions: Option<bool>,
    pub no_cache: bool,
    pub files: Vec<PathBuf>,
    pub ports: Vec<String>,
    pub restart: String,
    pub volumes: Vec<String>,
    pub volumes_from: Vec<String>,
    pub links: Vec<String>,
    pub environments: Vec<String>,
    pub webhook: Option<String>,
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| DockershipError::Config(e.to_string()))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            DockershipError::Config(format!("unable to read {}: {e}", path.display()))
        })?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Self::from_toml(&text)
    }

    /// Validate every section and resolve the project graph.
    pub fn into_catalog(self) -> Result<Catalog> {
        let mut environments = Vec::with_capacity(self.environments.len());
        for (name, env) in self.environments {
            if env.docker_endpoints.is_empty() {
                return Err(DockershipError::Config(format!(
                    "environment '{name}' declares no docker endpoints"
                )));
            }
            environments.push(Environment {
                name,
                docker_endpoints: env.docker_endpoints,
                etcd_servers: env.etcd_servers,
                cert_path: env.cert_path,
            });
        }

        let projects = self
            .projects
            .into_iter()
            .map(|(name, project)| project.into_project(name, &self.global))
            .collect::<Result<Vec<_>>>()?;

        Catalog::new(projects, environments)
    }
}

impl ProjectConfig {
    fn into_project(self, name: String, global: &GlobalConfig) -> Result<Project> {
        let repository = parse_vcs(&self.repository)?;
        let related_repositories = self
            .related_repositories
            .iter()
            .map(|r| parse_vcs(r))
            .collect::<Result<Vec<_>>>()?;

        let ports = self
            .ports
            .iter()
            .map(|p| p.parse::<PortBinding>())
            .collect::<Result<Vec<_>>>()?;

        let links = self
            .links
            .iter()
            .map(|l| {
                let def: LinkDefinition = l.parse()?;
                Ok(Link {
                    alias: def.alias,
                    target: LinkTarget::Unresolved(def.project),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let restart: RestartPolicy = self.restart.parse()?;

        let mut project = Project::new(name, repository);
        project.related_repositories = related_repositories;
        project.dockerfile = self
            .dockerfile
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| DEFAULT_DOCKERFILE.to_string());
        project.github_token = self.github_token.or_else(|| global.github_token.clone());
        project.history = self.history.unwrap_or(DEFAULT_HISTORY);
        project.use_short_revisions = self
            .use_short_revisions
            .unwrap_or(global.use_short_revisions);
        project.no_cache = self.no_cache;
        project.files = self.files;
        project.ports = ports;
        project.restart = restart;
        project.volumes = self.volumes;
        project.volumes_from = self.volumes_from;
        project.environments = self.environments;
        project.links = links;
        project.webhook = self.webhook.filter(|w| !w.is_empty());

        Ok(project)
    }
}

fn parse_vcs(origin: &str) -> Result<Vcs> {
    let vcs = Vcs::new(origin);
    vcs.info()?;
    Ok(vcs)
}

/// Read, validate and resolve a configuration file.
pub async fn load_catalog(path: &Path) -> Result<Catalog> {
    Config::load(path).await?.into_catalog()
}
