//! Shared types, errors, and the project model for the Dockership deploy engine.
//!
//! This crate provides the foundational types used across all other Dockership crates:
//! - `DockershipError`: unified error taxonomy
//! - `Vcs`, `Commit`, `Revision`: source identity of a project
//! - `Image`, `Container`, `ImageId`: engine-reported records
//! - `Project`, `Environment`, `Link`: the static configuration graph
//! - `TaskStatus`: registry of in-flight tasks

pub mod container;
pub mod project;
pub mod revision;
pub mod task;

pub use container::{Container, Image, ImageId, PortMapping};
pub use project::{
    Environment, Link, LinkDefinition, LinkTarget, PortBinding, Project, RestartPolicy,
    DEFAULT_DOCKERFILE, DEFAULT_HISTORY,
};
pub use revision::{Commit, Revision, Vcs, VcsInfo, DEFAULT_BRANCH};
pub use task::{Task, TaskGuard, TaskStatus};

/// Unified error type for all Dockership subsystems.
#[derive(Debug, thiserror::Error)]
pub enum DockershipError {
    // === Configuration Errors ===
    #[error("Undefined environment '{environment}' in project '{project}'")]
    UndefinedEnvironment {
        project: String,
        environment: String,
    },

    #[error("Undefined project '{0}'")]
    UndefinedProject(String),

    #[error("Malformed VCS reference {0:?}")]
    MalformedVcs(String),

    #[error("Malformed port {0:?}")]
    MalformedPort(String),

    #[error("Malformed restart policy {0:?}")]
    MalformedRestartPolicy(String),

    #[error("Malformed link {0:?}")]
    MalformedLink(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    // === Source Errors ===
    #[error("Source provider error for {repository}: {message}")]
    Source { repository: String, message: String },

    #[error("File '{path}' not found in {repository}")]
    FileNotFound { repository: String, path: String },

    #[error("A revision needs at least one repository commit")]
    EmptyRevision,

    // === Key-Value Store Errors ===
    #[error("Key {0:?} not found")]
    KeyNotFound(String),

    #[error("Key {0:?} is a directory")]
    KeyIsDirectory(String),

    #[error("Key-value store unreachable: {0}")]
    StoreUnreachable(String),

    // === Engine Errors ===
    #[error("Engine {operation} failed: {message}")]
    Engine { operation: String, message: String },

    #[error("Unable to restart one or more containers")]
    CascadeRestart { containers: Vec<String> },

    #[error("{endpoint}: {source}")]
    Endpoint {
        endpoint: String,
        #[source]
        source: Box<DockershipError>,
    },

    // === Task Registry ===
    #[error("A {task} task is already running for '{project}' on '{environment}'")]
    TaskInProgress {
        project: String,
        environment: String,
        task: Task,
    },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Coarse classification of a [`DockershipError`], used to decide how far a
/// failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Source,
    Template,
    Engine,
    Cascade,
    Task,
    Other,
}

impl DockershipError {
    /// Shorthand for an engine failure of the named operation.
    pub fn engine(operation: impl Into<String>, message: impl ToString) -> Self {
        DockershipError::Engine {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Attribute this error to an engine endpoint.
    pub fn at_endpoint(self, endpoint: impl Into<String>) -> Self {
        DockershipError::Endpoint {
            endpoint: endpoint.into(),
            source: Box::new(self),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DockershipError::UndefinedEnvironment { .. }
            | DockershipError::UndefinedProject(_)
            | DockershipError::MalformedVcs(_)
            | DockershipError::MalformedPort(_)
            | DockershipError::MalformedRestartPolicy(_)
            | DockershipError::MalformedLink(_)
            | DockershipError::Config(_) => ErrorKind::Configuration,
            DockershipError::Source { .. }
            | DockershipError::FileNotFound { .. }
            | DockershipError::EmptyRevision => ErrorKind::Source,
            DockershipError::KeyNotFound(_)
            | DockershipError::KeyIsDirectory(_)
            | DockershipError::StoreUnreachable(_) => ErrorKind::Template,
            DockershipError::Engine { .. } => ErrorKind::Engine,
            DockershipError::CascadeRestart { .. } => ErrorKind::Cascade,
            DockershipError::Endpoint { source, .. } => source.kind(),
            DockershipError::TaskInProgress { .. } => ErrorKind::Task,
            DockershipError::Io(_) | DockershipError::Json(_) | DockershipError::Other(_) => {
                ErrorKind::Other
            }
        }
    }

    /// Returns `true` for failures that are reported but never undo a deploy.
    pub fn is_soft(&self) -> bool {
        matches!(self.kind(), ErrorKind::Cascade | ErrorKind::Template)
    }
}

/// A convenience alias for `Result<T, DockershipError>`.
pub type Result<T> = std::result::Result<T, DockershipError>;
