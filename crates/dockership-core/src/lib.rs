//! Deploy orchestration for Dockership.
//!
//! A deploy resolves the project's head revision across all of its
//! repositories, renders the Dockerfile template, then runs the
//! single-endpoint pipeline ([`Docker`]) on every endpoint of the environment
//! concurrently ([`DockerGroup`]). [`Dockership`] ties this to a loaded
//! [`Catalog`] and a [`Connector`] that provides the live collaborators.

pub mod catalog;
pub mod config;
pub mod connector;
pub mod docker;
pub mod dockerfile;
pub mod engine;
pub mod events;
pub mod group;
pub mod memory;
pub mod project;
pub mod source;

pub use catalog::Catalog;
pub use config::{load_catalog, Config, DEFAULT_CONFIG_FILE};
pub use connector::{Connector, WebhookPayload, WebhookSink};
pub use docker::{build_context, Docker};
pub use dockerfile::{KeyValueStore, TemplateContext};
pub use engine::{ContainerSpec, Engine, HostBinding, HostConfig, OutputLine, OutputSink};
pub use events::{DeployEvent, EventEmitter, LogLevel};
pub use group::DockerGroup;
pub use project::{DeployReport, Dockership, ProjectStatus};
pub use source::{fetch_dockerfile, resolve_revision, SourceProvider};
