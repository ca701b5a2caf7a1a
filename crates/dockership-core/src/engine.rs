//! Container engine capability trait, host configuration, and build output sink.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use dockership_types::{Container, Image, ImageId, Project, RestartPolicy, Result};

// ---------------------------------------------------------------------------
// Engine trait
// ---------------------------------------------------------------------------

/// The container-engine operations the deploy pipeline needs from one endpoint.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Address this engine was connected to; stamped on every record it returns.
    fn endpoint(&self) -> &str;

    /// Every container on the endpoint, stopped ones included.
    async fn list_containers(&self) -> Result<Vec<Container>>;

    async fn list_images(&self) -> Result<Vec<Image>>;

    /// Build `context` (a tar archive) into an image tagged `tag`, streaming the
    /// build log to `output`.
    async fn build_image(
        &self,
        tag: &ImageId,
        context: Vec<u8>,
        no_cache: bool,
        output: &OutputSink,
    ) -> Result<()>;

    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start a created (or killed) container. Engines that only accept host
    /// settings at creation time may ignore `host_config` here.
    async fn start_container(&self, id: &str, host_config: &HostConfig) -> Result<()>;

    async fn kill_container(&self, id: &str) -> Result<()>;

    async fn remove_container(&self, id: &str) -> Result<()>;

    async fn remove_image(&self, id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// HostConfig / ContainerSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostBinding {
    pub host_ip: String,
    pub host_port: String,
}

/// Runtime settings applied when a container starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostConfig {
    /// Container port (`80/tcp`) → host bindings.
    pub port_bindings: BTreeMap<String, Vec<HostBinding>>,
    pub links: Vec<String>,
    pub restart_policy: RestartPolicy,
    pub volumes_from: Vec<String>,
}

impl HostConfig {
    /// Host settings for `project` when running in `environment`. Port
    /// mappings scoped to another environment and unresolved links are left out.
    pub fn for_project(project: &Project, environment: &str) -> Self {
        let mut port_bindings: BTreeMap<String, Vec<HostBinding>> = BTreeMap::new();
        for port in project.ports.iter().filter(|p| p.applies_to(environment)) {
            port_bindings
                .entry(port.container_key())
                .or_default()
                .push(HostBinding {
                    host_ip: port.host_ip.clone(),
                    host_port: port.host_port.clone(),
                });
        }

        let links = project
            .links
            .iter()
            .filter_map(|link| {
                let resolved = link.container_link();
                if resolved.is_none() {
                    tracing::warn!(
                        project = %project.name,
                        link = link.project_name(),
                        "Skipping unresolved link"
                    );
                }
                resolved
            })
            .collect();

        Self {
            port_bindings,
            links,
            restart_policy: project.restart,
            volumes_from: project.volumes_from.clone(),
        }
    }
}

/// Everything needed to create a project's container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: ImageId,
    pub volumes: Vec<String>,
    pub host_config: HostConfig,
}

// ---------------------------------------------------------------------------
// OutputSink
// ---------------------------------------------------------------------------

/// One line of build output, tagged with the endpoint that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub endpoint: String,
    pub line: String,
}

/// Destination for build logs. Cloning shares the destination, so every
/// endpoint of a fan-out can write to the same sink.
#[derive(Debug, Clone, Default)]
pub struct OutputSink {
    sender: Option<mpsc::UnboundedSender<OutputLine>>,
}

impl OutputSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutputLine>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// A sink that drops everything written to it.
    pub fn discard() -> Self {
        Self::default()
    }

    /// If the receiving side is gone the line is silently dropped.
    pub fn write(&self, endpoint: &str, line: impl Into<String>) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(OutputLine {
                endpoint: endpoint.to_string(),
                line: line.into(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockership_types::{Link, LinkTarget};

    fn project_with_ports(ports: &[&str]) -> Project {
        let mut p = Project::new("web", "git@github.com:foo/web.git");
        p.ports = ports.iter().map(|s| s.parse().unwrap()).collect();
        p
    }

    #[test]
    fn ports_group_by_container_port() {
        let p = project_with_ports(&[
            "0.0.0.0:8080:80/tcp",
            "0.0.0.0:8080:80/udp",
            "0.0.0.0:42:42/tcp",
            "1.1.1.1:42:80/tcp",
        ]);
        let host = HostConfig::for_project(&p, "live");

        assert_eq!(host.port_bindings.len(), 3);
        let tcp = &host.port_bindings["80/tcp"];
        assert_eq!(tcp.len(), 2);
        assert_eq!(tcp[0].host_ip, "0.0.0.0");
        assert_eq!(tcp[0].host_port, "8080");
        assert_eq!(host.port_bindings["80/udp"].len(), 1);
        assert_eq!(host.port_bindings["42/tcp"].len(), 1);
    }

    #[test]
    fn ports_scoped_to_other_environment_are_dropped() {
        let p = project_with_ports(&["0.0.0.0:80:80/tcp@live", "0.0.0.0:81:81/tcp@testing"]);
        let host = HostConfig::for_project(&p, "live");
        assert_eq!(host.port_bindings.keys().collect::<Vec<_>>(), vec!["80/tcp"]);
    }

    #[test]
    fn only_resolved_links_are_passed() {
        let mut p = Project::new("web", "git@github.com:foo/web.git");
        p.links = vec![
            Link {
                alias: "database".into(),
                target: LinkTarget::Resolved("db".into()),
            },
            Link {
                alias: "cache".into(),
                target: LinkTarget::Unresolved("redis".into()),
            },
        ];
        p.restart = RestartPolicy::Always;
        p.volumes_from = vec!["data".into()];

        let host = HostConfig::for_project(&p, "live");
        assert_eq!(host.links, vec!["db:database".to_string()]);
        assert_eq!(host.restart_policy, RestartPolicy::Always);
        assert_eq!(host.volumes_from, vec!["data".to_string()]);
    }

    #[tokio::test]
    async fn output_sink_tags_lines() {
        let (sink, mut rx) = OutputSink::channel();
        let other = sink.clone();
        sink.write("a", "Step 1/2");
        other.write("b", "Step 2/2");

        assert_eq!(
            rx.recv().await.unwrap(),
            OutputLine {
                endpoint: "a".into(),
                line: "Step 1/2".into()
            }
        );
        assert_eq!(rx.recv().await.unwrap().endpoint, "b");
    }

    #[test]
    fn discard_sink_does_not_panic() {
        OutputSink::discard().write("a", "ignored");
    }
}
