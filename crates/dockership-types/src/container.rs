//! Engine-reported images and containers, tagged with the endpoint they live on.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::revision::Revision;

const SHORT_ID_LEN: usize = 12;

// ---------------------------------------------------------------------------
// ImageId
// ---------------------------------------------------------------------------

/// An image reference of the form `<project>:<revision>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn belongs_to(&self, project: &str) -> bool {
        self.0.starts_with(project)
    }

    /// The part before the first `:`.
    pub fn project_part(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(p, _)| p)
    }

    /// The part after the first `:`, empty when the tag has none.
    pub fn revision_part(&self) -> &str {
        self.0.split_once(':').map_or("", |(_, r)| r)
    }

    pub fn is_revision(&self, revision: &Revision) -> bool {
        let part = self.revision_part();
        !part.is_empty() && part.starts_with(&revision.get_short())
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Image
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub endpoint: String,
    pub id: String,
    pub repo_tags: Vec<String>,
    /// Creation time as a unix timestamp.
    pub created: i64,
}

impl Image {
    pub fn belongs_to(&self, project: &str) -> bool {
        self.repo_tags.iter().any(|tag| tag.starts_with(project))
    }

    pub fn tags(&self) -> impl Iterator<Item = ImageId> + '_ {
        self.repo_tags.iter().map(|t| ImageId::new(t.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Container
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub ip: String,
    pub private_port: u16,
    pub public_port: u16,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub endpoint: String,
    pub id: String,
    pub image: ImageId,
    pub names: Vec<String>,
    pub status: String,
    pub created: i64,
    pub ports: Vec<PortMapping>,
}

impl Container {
    /// Engines report running containers with a status like `Up 3 hours`.
    pub fn is_running(&self) -> bool {
        self.status.starts_with("Up ")
    }

    pub fn short_id(&self) -> &str {
        match self.id.char_indices().nth(SHORT_ID_LEN) {
            Some((idx, _)) => &self.id[..idx],
            None => &self.id,
        }
    }

    pub fn ports_string(&self) -> String {
        self.ports
            .iter()
            .map(|p| {
                if p.ip.is_empty() {
                    format!("{}/{}", p.private_port, p.kind)
                } else {
                    format!("{}:{}->{}/{}", p.ip, p.public_port, p.private_port, p.kind)
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn belongs_to(&self, project: &str) -> bool {
        if self.image.belongs_to(project) {
            return true;
        }

        let name = format!("/{project}");
        self.names.iter().any(|n| *n == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(name: &str, image: &str, status: &str) -> Container {
        Container {
            endpoint: "tcp://a:2375".into(),
            id: "3f4e5d6c7b8a9f0e1d2c".into(),
            image: ImageId::new(image),
            names: vec![name.to_string()],
            status: status.into(),
            created: 0,
            ports: vec![],
        }
    }

    #[test]
    fn container_belongs_by_name() {
        assert!(container("/foo", "sha256:abc", "Up 1 second").belongs_to("foo"));
        assert!(!container("/bar", "sha256:abc", "Up 1 second").belongs_to("foo"));
    }

    #[test]
    fn container_belongs_by_image() {
        assert!(container("/other", "foo:1234", "Exited (0)").belongs_to("foo"));
    }

    #[test]
    fn image_belongs_by_tag_prefix() {
        let image = Image {
            endpoint: "a".into(),
            id: "sha256:1".into(),
            repo_tags: vec!["foo:anything".into()],
            created: 1,
        };
        assert!(image.belongs_to("foo"));
        assert!(!image.belongs_to("bar"));
    }

    #[test]
    fn running_status() {
        assert!(container("/foo", "foo:1", "Up 3 hours").is_running());
        assert!(!container("/foo", "foo:1", "Exited (137) 2 minutes ago").is_running());
    }

    #[test]
    fn image_id_parts() {
        let id = ImageId::new("foo:0123456789abcdef");
        assert_eq!(id.project_part(), "foo");
        assert_eq!(id.revision_part(), "0123456789abcdef");
        assert!(id.is_revision(&Revision::single("r", "0123456789abcdef")));
        assert!(!id.is_revision(&Revision::single("r", "ffff")));
        assert_eq!(ImageId::new("foo").revision_part(), "");
    }

    #[test]
    fn short_id_truncates() {
        let c = container("/foo", "foo:1", "Up 1 second");
        assert_eq!(c.short_id(), "3f4e5d6c7b8a");
    }

    #[test]
    fn ports_string_formats_published_and_exposed() {
        let mut c = container("/foo", "foo:1", "Up 1 second");
        c.ports = vec![
            PortMapping {
                ip: "0.0.0.0".into(),
                private_port: 80,
                public_port: 8080,
                kind: "tcp".into(),
            },
            PortMapping {
                ip: String::new(),
                private_port: 443,
                public_port: 0,
                kind: "tcp".into(),
            },
        ];
        assert_eq!(c.ports_string(), "0.0.0.0:8080->80/tcp, 443/tcp");
    }
}
