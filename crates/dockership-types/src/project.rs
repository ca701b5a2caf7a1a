//! The static configuration graph: projects, environments, links, and the
//! port/restart syntax projects declare.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;

use crate::container::ImageId;
use crate::revision::{Revision, Vcs};
use crate::task::TaskStatus;
use crate::{DockershipError, Result};

pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";
pub const DEFAULT_HISTORY: i32 = 3;

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// A named set of engine endpoints a project deploys to together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Environment {
    pub name: String,
    pub docker_endpoints: Vec<String>,
    pub etcd_servers: Vec<String>,
    /// Directory holding `cert.pem`, `key.pem` and `ca.pem` for TLS endpoints.
    pub cert_path: Option<PathBuf>,
}

impl Environment {
    pub fn new(name: impl Into<String>, docker_endpoints: Vec<String>) -> Self {
        Self {
            name: name.into(),
            docker_endpoints,
            etcd_servers: Vec::new(),
            cert_path: None,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

/// A declared `project:alias` pair, as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkDefinition {
    pub project: String,
    pub alias: String,
}

impl FromStr for LinkDefinition {
    type Err = DockershipError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((project, alias)) if !project.is_empty() && !alias.is_empty() => Ok(Self {
                project: project.to_string(),
                alias: alias.to_string(),
            }),
            _ => Err(DockershipError::MalformedLink(s.to_string())),
        }
    }
}

/// Outcome of resolving a link against the set of declared projects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "project", rename_all = "snake_case")]
pub enum LinkTarget {
    Resolved(String),
    Unresolved(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Link {
    pub alias: String,
    pub target: LinkTarget,
}

impl Link {
    pub fn project_name(&self) -> &str {
        match &self.target {
            LinkTarget::Resolved(name) | LinkTarget::Unresolved(name) => name,
        }
    }

    /// The `container:alias` form the engine expects, only for resolved links.
    pub fn container_link(&self) -> Option<String> {
        match &self.target {
            LinkTarget::Resolved(name) => Some(format!("{}:{}", name, self.alias)),
            LinkTarget::Unresolved(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// PortBinding
// ---------------------------------------------------------------------------

/// `<host_ip>:<host_port>:<container_port>/<proto>[@<environment>]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: String,
    pub container_port: String,
    pub protocol: String,
    pub environment: Option<String>,
}

impl PortBinding {
    /// Whether this mapping is active in the named environment.
    pub fn applies_to(&self, environment: &str) -> bool {
        self.environment.as_deref().map_or(true, |e| e == environment)
    }

    /// Engine key for the container side, e.g. `80/tcp`.
    pub fn container_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

impl FromStr for PortBinding {
    type Err = DockershipError;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || DockershipError::MalformedPort(s.to_string());

        let (mapping, environment) = match s.split_once('@') {
            Some((mapping, env)) if !env.is_empty() => (mapping, Some(env.to_string())),
            Some(_) => return Err(malformed()),
            None => (s, None),
        };

        let (ports, protocol) = mapping.split_once('/').ok_or_else(malformed)?;
        let parts: Vec<&str> = ports.splitn(3, ':').collect();
        let [host_ip, host_port, container_port] = parts.as_slice() else {
            return Err(malformed());
        };
        if container_port.is_empty() || protocol.is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            host_ip: host_ip.to_string(),
            host_port: host_port.to_string(),
            container_port: container_port.to_string(),
            protocol: protocol.to_string(),
            environment,
        })
    }
}

// ---------------------------------------------------------------------------
// RestartPolicy
// ---------------------------------------------------------------------------

/// `no` | `always` | `on-failure:<N>`; an empty string means `no`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
    OnFailure(u32),
}

impl RestartPolicy {
    /// Engine policy name.
    pub fn name(&self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure(_) => "on-failure",
        }
    }

    pub fn max_retry_count(&self) -> u32 {
        match self {
            RestartPolicy::OnFailure(n) => *n,
            _ => 0,
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = DockershipError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            None if s.is_empty() || s == "no" => Ok(RestartPolicy::No),
            None if s == "always" => Ok(RestartPolicy::Always),
            Some(("on-failure", retries)) => retries
                .parse()
                .map(RestartPolicy::OnFailure)
                .map_err(|_| DockershipError::MalformedRestartPolicy(s.to_string())),
            _ => Err(DockershipError::MalformedRestartPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::OnFailure(n) => write!(f, "on-failure:{n}"),
            other => f.write_str(other.name()),
        }
    }
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

/// A deployable unit backed by one or more repositories and a Dockerfile.
///
/// `links` and `linked_by` refer to other projects by name; resolve them
/// through the catalog that owns every project.
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub name: String,
    pub repository: Vcs,
    pub related_repositories: Vec<Vcs>,
    pub dockerfile: String,
    #[serde(skip)]
    pub github_token: Option<String>,
    pub history: i32,
    pub use_short_revisions: bool,
    pub no_cache: bool,
    pub files: Vec<PathBuf>,
    pub ports: Vec<PortBinding>,
    pub restart: RestartPolicy,
    pub volumes: Vec<String>,
    pub volumes_from: Vec<String>,
    pub environments: Vec<String>,
    pub links: Vec<Link>,
    pub linked_by: Vec<String>,
    #[serde(skip)]
    pub task_status: TaskStatus,
    pub webhook: Option<String>,
}

impl Project {
    pub fn new(name: impl Into<String>, repository: impl Into<Vcs>) -> Self {
        Self {
            name: name.into(),
            repository: repository.into(),
            related_repositories: Vec::new(),
            dockerfile: DEFAULT_DOCKERFILE.to_string(),
            github_token: None,
            history: DEFAULT_HISTORY,
            use_short_revisions: true,
            no_cache: false,
            files: Vec::new(),
            ports: Vec::new(),
            restart: RestartPolicy::No,
            volumes: Vec::new(),
            volumes_from: Vec::new(),
            environments: Vec::new(),
            links: Vec::new(),
            linked_by: Vec::new(),
            task_status: TaskStatus::default(),
            webhook: None,
        }
    }

    /// The primary repository followed by every related one.
    pub fn repositories(&self) -> impl Iterator<Item = &Vcs> {
        std::iter::once(&self.repository).chain(self.related_repositories.iter())
    }

    pub fn has_environment(&self, name: &str) -> bool {
        self.environments.iter().any(|e| e == name)
    }

    /// Tag for images built from `revision`.
    pub fn image_name(&self, revision: &Revision) -> ImageId {
        let rev = if self.use_short_revisions {
            revision.get_short()
        } else {
            revision.get()
        };

        ImageId::new(format!("{}:{}", self.name, rev))
    }
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.repository.info() {
            Ok(info) => write!(f, "{}/{}!{}", info.username, info.name, info.branch),
            Err(_) => f.write_str(&self.name),
        }
    }
}
