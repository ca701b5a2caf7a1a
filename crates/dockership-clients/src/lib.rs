//! HTTP implementations of the Dockership collaborator traits: GitHub as the
//! source provider, the Docker Engine API, etcd v2 for template keys, and
//! JSON webhooks.

pub mod connector;
pub mod docker;
pub mod etcd;
pub mod github;
pub mod webhook;

pub use connector::{DryRunConnector, HttpConnector};
pub use docker::DockerHttpEngine;
pub use etcd::EtcdClient;
pub use github::{GithubClient, GITHUB_API_URL};
pub use webhook::HttpWebhook;
