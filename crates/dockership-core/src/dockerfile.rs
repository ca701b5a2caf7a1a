//! Dockerfile templating.
//!
//! Two passes over the raw blob:
//! 1. `$DOCKERSHIP_PROJECT`, `$DOCKERSHIP_ENV`, `$DOCKERSHIP_VCS` and
//!    `$DOCKERSHIP_REV` become the project name, environment name, primary
//!    repository origin and short revision.
//! 2. `$ETCD_<KEY>` tokens are looked up in the environment's key-value store,
//!    with `__` in the key standing for `/`. A failed lookup leaves the token in
//!    place and logs a warning; rendering itself never fails.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use async_trait::async_trait;
use futures::future::join_all;
use regex::bytes::{Captures, Regex};

use dockership_types::{Environment, Project, Result, Revision};

static STORE_VARIABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$ETCD_([A-Za-z0-9_]+)").unwrap());

/// Read-only access to an environment's key-value store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Errors with `KeyNotFound`, `KeyIsDirectory` or `StoreUnreachable`.
    async fn get(&self, key: &str) -> Result<String>;
}

/// What the info variables are filled from.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub project: &'a Project,
    pub revision: &'a Revision,
    pub environment: &'a Environment,
}

/// Render a Dockerfile blob. Without a context the blob is returned untouched.
/// Both passes work on raw bytes, so bytes outside the tokens survive as-is
/// whatever their encoding.
pub async fn render(
    blob: &[u8],
    context: Option<&TemplateContext<'_>>,
    store: Option<&dyn KeyValueStore>,
) -> Vec<u8> {
    let Some(context) = context else {
        return blob.to_vec();
    };

    let blob = resolve_info_variables(blob, context);
    match store {
        Some(store) => resolve_store_variables(&blob, store, &context.environment.name).await,
        None => blob,
    }
}

pub fn resolve_info_variables(blob: &[u8], context: &TemplateContext<'_>) -> Vec<u8> {
    let vars = [
        ("PROJECT", context.project.name.clone()),
        ("ENV", context.environment.name.clone()),
        ("VCS", context.project.repository.to_string()),
        ("REV", context.revision.get_short()),
    ];

    let mut result = blob.to_vec();
    for (name, value) in vars {
        let token = format!("$DOCKERSHIP_{name}");
        result = replace_bytes(&result, token.as_bytes(), value.as_bytes());
    }
    result
}

fn replace_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(at) = rest.windows(needle.len()).position(|w| w == needle) {
        out.extend_from_slice(&rest[..at]);
        out.extend_from_slice(replacement);
        rest = &rest[at + needle.len()..];
    }
    out.extend_from_slice(rest);
    out
}

pub async fn resolve_store_variables(
    blob: &[u8],
    store: &dyn KeyValueStore,
    environment: &str,
) -> Vec<u8> {
    // Names match [A-Za-z0-9_]+, so they are always valid UTF-8.
    let names: BTreeSet<&str> = STORE_VARIABLE
        .captures_iter(blob)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| std::str::from_utf8(m.as_bytes()).ok())
        .collect();

    if names.is_empty() {
        return blob.to_vec();
    }

    let lookups = names.into_iter().map(|name| async move {
        let key = name.replace("__", "/");
        match store.get(&key).await {
            Ok(value) => Some((name.as_bytes().to_vec(), value.into_bytes())),
            Err(err) => {
                tracing::warn!(key = %key, environment, error = %err, "Unable to retrieve key from store");
                None
            }
        }
    });

    let values: HashMap<Vec<u8>, Vec<u8>> = join_all(lookups).await.into_iter().flatten().collect();

    STORE_VARIABLE
        .replace_all(blob, |caps: &Captures| match values.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_vec(),
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn fixtures() -> (Project, Revision, Environment) {
        (
            Project::new("foo", "qux"),
            Revision::single("foo", "baz"),
            Environment::new("bar", vec![]),
        )
    }

    #[tokio::test]
    async fn info_variables_are_replaced() {
        let (project, revision, environment) = fixtures();
        let ctx = TemplateContext {
            project: &project,
            revision: &revision,
            environment: &environment,
        };

        let out = render(
            b"$DOCKERSHIP_PROJECT/$DOCKERSHIP_ENV/$DOCKERSHIP_VCS/$DOCKERSHIP_REV",
            Some(&ctx),
            None,
        )
        .await;
        assert_eq!(String::from_utf8(out).unwrap(), "foo/bar/qux/baz");
    }

    #[tokio::test]
    async fn store_miss_leaves_token_in_place() {
        let (project, revision, environment) = fixtures();
        let ctx = TemplateContext {
            project: &project,
            revision: &revision,
            environment: &environment,
        };
        let store = MemoryStore::new().with_value("foo", "X");

        let out = render(b"$ETCD_foo $ETCD_missing", Some(&ctx), Some(&store)).await;
        assert_eq!(String::from_utf8(out).unwrap(), "X $ETCD_missing");
    }

    #[tokio::test]
    async fn double_underscore_maps_to_nested_key() {
        let store = MemoryStore::new().with_value("db/host", "10.0.0.5");
        let out = resolve_store_variables(b"ENV DB_HOST=$ETCD_db__host", &store, "live").await;
        assert_eq!(out, b"ENV DB_HOST=10.0.0.5");
    }

    #[tokio::test]
    async fn directory_and_unreachable_are_misses() {
        let store = MemoryStore::new().with_directory("dir");
        let out = resolve_store_variables(b"$ETCD_dir", &store, "live").await;
        assert_eq!(out, b"$ETCD_dir");

        let down = MemoryStore::new().with_value("foo", "X").unreachable();
        let out = resolve_store_variables(b"$ETCD_foo", &down, "live").await;
        assert_eq!(out, b"$ETCD_foo");
    }

    #[tokio::test]
    async fn longer_names_are_not_clobbered_by_prefixes() {
        let store = MemoryStore::new()
            .with_value("foo", "short")
            .with_value("foobar", "long");
        let out = resolve_store_variables(b"$ETCD_foo $ETCD_foobar", &store, "live").await;
        assert_eq!(out, b"short long");
    }

    #[tokio::test]
    async fn without_context_blob_is_untouched() {
        let store = MemoryStore::new().with_value("foo", "X");
        let out = render(b"$DOCKERSHIP_PROJECT $ETCD_foo", None, Some(&store)).await;
        assert_eq!(out, b"$DOCKERSHIP_PROJECT $ETCD_foo");
    }

    #[tokio::test]
    async fn non_utf8_bytes_survive_rendering() {
        let (project, revision, environment) = fixtures();
        let ctx = TemplateContext {
            project: &project,
            revision: &revision,
            environment: &environment,
        };
        let store = MemoryStore::new().with_value("user", "app");

        let out = render(
            b"# caf\xe9\nFROM $DOCKERSHIP_PROJECT\nUSER $ETCD_user \xff\n",
            Some(&ctx),
            Some(&store),
        )
        .await;
        assert_eq!(out, b"# caf\xe9\nFROM foo\nUSER app \xff\n");
    }
}
