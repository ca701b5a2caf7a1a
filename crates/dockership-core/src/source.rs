//! Source provider capability and revision resolution.

use async_trait::async_trait;
use futures::future::join_all;

use dockership_types::{Commit, DockershipError, Project, Result, Revision, Vcs};

#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Head commit of the reference's branch.
    async fn last_commit(&self, vcs: &Vcs) -> Result<Commit>;

    /// Content of `path` at `reference`; errors when the file is absent.
    async fn file_content(&self, vcs: &Vcs, reference: &str, path: &str) -> Result<Vec<u8>>;
}

/// Fetch the head commit of every repository of `project` concurrently.
///
/// Either every repository resolves or the first failure (in declaration
/// order) is returned; a partial revision is never produced.
pub async fn resolve_revision(source: &dyn SourceProvider, project: &Project) -> Result<Revision> {
    tracing::debug!(project = %project.name, "Retrieving last revision");

    let fetches = project.repositories().map(|vcs| async move {
        let commit = source.last_commit(vcs).await?;
        tracing::debug!(project = %project.name, repository = %vcs, commit = %commit, "Last commit");
        Ok::<_, DockershipError>((vcs.clone(), commit))
    });

    let commits = join_all(fetches)
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

    Revision::new(commits)
}

/// Fetch the project's Dockerfile at the primary repository's commit.
pub async fn fetch_dockerfile(
    source: &dyn SourceProvider,
    project: &Project,
    revision: &Revision,
) -> Result<Vec<u8>> {
    let commit = revision
        .commit(&project.repository)
        .ok_or_else(|| DockershipError::Source {
            repository: project.repository.to_string(),
            message: "revision has no commit for the primary repository".into(),
        })?;

    tracing::debug!(project = %project.name, commit = %commit, path = %project.dockerfile, "Retrieving dockerfile");
    source
        .file_content(&project.repository, commit.as_str(), &project.dockerfile)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySource;

    fn project() -> Project {
        let mut p = Project::new("web", "git@github.com:foo/web.git");
        p.related_repositories = vec![
            Vcs::new("git@github.com:foo/lib.git"),
            Vcs::new("git@github.com:foo/assets.git"),
        ];
        p
    }

    #[tokio::test]
    async fn resolves_one_commit_per_repository() {
        let source = MemorySource::new()
            .with_commit("git@github.com:foo/web.git", "aaa")
            .with_commit("git@github.com:foo/lib.git", "bbb")
            .with_commit("git@github.com:foo/assets.git", "ccc");

        let rev = resolve_revision(&source, &project()).await.unwrap();
        assert_eq!(rev.len(), 3);
        assert_eq!(
            rev.commit(&Vcs::new("git@github.com:foo/lib.git")).unwrap().as_str(),
            "bbb"
        );
    }

    #[tokio::test]
    async fn any_failure_fails_the_whole_resolution() {
        let source = MemorySource::new()
            .with_commit("git@github.com:foo/web.git", "aaa")
            .with_commit("git@github.com:foo/assets.git", "ccc");

        let err = resolve_revision(&source, &project()).await.unwrap_err();
        assert!(matches!(err, DockershipError::Source { ref repository, .. } if repository == "git@github.com:foo/lib.git"));
    }

    #[tokio::test]
    async fn single_repository_revision_identity_is_commit() {
        let source = MemorySource::new().with_commit("git@github.com:foo/web.git", "abc123");
        let p = Project::new("web", "git@github.com:foo/web.git");
        let rev = resolve_revision(&source, &p).await.unwrap();
        assert_eq!(rev.get(), "abc123");
    }

    #[tokio::test]
    async fn dockerfile_is_read_at_primary_commit() {
        let source = MemorySource::new()
            .with_commit("git@github.com:foo/web.git", "abc123")
            .with_file("git@github.com:foo/web.git", "abc123", "Dockerfile", "FROM base\n");
        let p = Project::new("web", "git@github.com:foo/web.git");
        let rev = resolve_revision(&source, &p).await.unwrap();

        let blob = fetch_dockerfile(&source, &p, &rev).await.unwrap();
        assert_eq!(blob, b"FROM base\n");
    }

    #[tokio::test]
    async fn missing_dockerfile_is_an_error() {
        let source = MemorySource::new().with_commit("git@github.com:foo/web.git", "abc123");
        let p = Project::new("web", "git@github.com:foo/web.git");
        let rev = resolve_revision(&source, &p).await.unwrap();

        let err = fetch_dockerfile(&source, &p, &rev).await.unwrap_err();
        assert!(matches!(err, DockershipError::FileNotFound { .. }));
    }
}
