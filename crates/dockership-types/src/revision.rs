//! Source identity: VCS references, commits, and multi-repository revisions.

use std::collections::BTreeMap;
use std::fmt;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::{DockershipError, Result};

pub const DEFAULT_BRANCH: &str = "master";

const SHORT_LEN: usize = 12;

fn shorten(id: &str) -> String {
    id.chars().take(SHORT_LEN).collect()
}

// ---------------------------------------------------------------------------
// Vcs
// ---------------------------------------------------------------------------

/// A repository origin with an optional `!branch` suffix, e.g.
/// `git@github.com:foo/bar.git!production`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vcs(String);

/// Parsed form of a [`Vcs`] reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsInfo {
    pub origin: String,
    pub host: String,
    pub username: String,
    pub name: String,
    pub branch: String,
}

impl Vcs {
    pub fn new(origin: impl Into<String>) -> Self {
        Self(origin.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        self.info().is_ok()
    }

    /// Split the reference into host, user, repository name and branch.
    pub fn info(&self) -> Result<VcsInfo> {
        let malformed = || DockershipError::MalformedVcs(self.0.clone());

        let (url, branch) = match self.0.split_once('!') {
            Some((url, branch)) if !branch.is_empty() => (url, branch),
            Some((url, _)) => (url, DEFAULT_BRANCH),
            None => (self.0.as_str(), DEFAULT_BRANCH),
        };

        let (host, path) = split_host_path(url).ok_or_else(malformed)?;
        let path = path.trim_matches('/');
        let path = path.strip_suffix(".git").unwrap_or(path);
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let username = segments.next().ok_or_else(malformed)?;
        let name = segments.next().ok_or_else(malformed)?;
        if host.is_empty() || segments.next().is_some() {
            return Err(malformed());
        }

        Ok(VcsInfo {
            origin: self.0.clone(),
            host: host.to_string(),
            username: username.to_string(),
            name: name.to_string(),
            branch: branch.to_string(),
        })
    }
}

/// Accepts `scheme://[user@]host[:port]/path`, `[user@]host:path` and `host/path`.
fn split_host_path(url: &str) -> Option<(&str, &str)> {
    if let Some((_, rest)) = url.split_once("://") {
        let (authority, path) = rest.split_once('/')?;
        let host = authority.rsplit('@').next()?;
        let host = host.split(':').next()?;
        return Some((host, path));
    }

    match (url.find(':'), url.find('/')) {
        (Some(colon), slash) if slash.map_or(true, |s| colon < s) => {
            let (authority, path) = (&url[..colon], &url[colon + 1..]);
            let host = authority.rsplit('@').next()?;
            Some((host, path))
        }
        _ => url.split_once('/'),
    }
}

impl fmt::Display for Vcs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Vcs {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

/// Opaque commit identifier reported by a source provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Commit(String);

impl Commit {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn get_short(&self) -> String {
        shorten(&self.0)
    }
}

impl fmt::Display for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.get_short())
    }
}

impl From<&str> for Commit {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ---------------------------------------------------------------------------
// Revision
// ---------------------------------------------------------------------------

/// The combined source state of a project: one commit per repository.
///
/// A revision always holds at least one entry. Its identity is the commit
/// itself when there is a single repository; otherwise the hex MD5 of the
/// commits sorted by value and joined by `:`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(BTreeMap<Vcs, Commit>);

impl Revision {
    pub fn new(commits: impl IntoIterator<Item = (Vcs, Commit)>) -> Result<Self> {
        let map: BTreeMap<Vcs, Commit> = commits.into_iter().collect();
        if map.is_empty() {
            return Err(DockershipError::EmptyRevision);
        }

        Ok(Self(map))
    }

    pub fn single(vcs: impl Into<Vcs>, commit: impl Into<Commit>) -> Self {
        Self(BTreeMap::from([(vcs.into(), commit.into())]))
    }

    pub fn get(&self) -> String {
        if self.0.len() == 1 {
            if let Some(commit) = self.0.values().next() {
                return commit.as_str().to_string();
            }
        }

        let mut commits: Vec<&str> = self.0.values().map(Commit::as_str).collect();
        commits.sort_unstable();
        format!("{:x}", Md5::digest(commits.join(":").as_bytes()))
    }

    pub fn get_short(&self) -> String {
        shorten(&self.get())
    }

    pub fn commit(&self, vcs: &Vcs) -> Option<&Commit> {
        self.0.get(vcs)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vcs, &Commit)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.get())
    }
}
