use async_trait::async_trait;
use base64::Engine as _;

use dockership_core::SourceProvider;
use dockership_types::{Commit, DockershipError, Result, Vcs, VcsInfo};

pub const GITHUB_API_URL: &str = "https://api.github.com";

/// Below this many remaining requests every call logs a warning.
const LOW_RATE_LIMIT: u64 = 100;

// ---------------------------------------------------------------------------
// GithubClient
// ---------------------------------------------------------------------------

/// Source provider backed by the GitHub REST API.
#[derive(Debug, Clone)]
pub struct GithubClient {
    client: reqwest::Client,
    token: Option<String>,
    base_url: String,
}

impl GithubClient {
    pub fn new(token: Option<String>) -> Self {
        Self::with_client(reqwest::Client::new(), token)
    }

    pub fn with_client(client: reqwest::Client, token: Option<String>) -> Self {
        Self {
            client,
            token,
            base_url: GITHUB_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    async fn get(
        &self,
        vcs: &Vcs,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<(reqwest::StatusCode, serde_json::Value)> {
        let source_error = |message: String| DockershipError::Source {
            repository: vcs.to_string(),
            message,
        };

        let mut request = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .header("accept", "application/vnd.github+json")
            .header("user-agent", "dockership");
        if let Some(token) = &self.token {
            request = request.header("authorization", format!("token {token}"));
        }

        let resp = request
            .send()
            .await
            .map_err(|e| source_error(e.to_string()))?;

        check_rate_limit(&resp);

        let status = resp.status();
        let body = resp.text().await.map_err(|e| source_error(e.to_string()))?;
        let json = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            return Err(source_error(format!("{status}: {}", extract_message(&json, &body))));
        }

        Ok((status, json))
    }
}

fn check_rate_limit(resp: &reqwest::Response) {
    let remaining = resp
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    if let Some(remaining) = remaining {
        if remaining < LOW_RATE_LIMIT {
            let limit = resp
                .headers()
                .get("x-ratelimit-limit")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("?");
            tracing::warn!(remaining, limit, "Low Github request level");
        }
    }
}

fn extract_message(json: &serde_json::Value, body: &str) -> String {
    json["message"]
        .as_str()
        .map(String::from)
        .unwrap_or_else(|| body.to_string())
}

fn repo_path(info: &VcsInfo) -> String {
    format!("/repos/{}/{}", info.username, info.name)
}

/// GitHub returns file content base64-encoded with embedded newlines.
fn decode_content(encoded: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD.decode(compact)
}

// ---------------------------------------------------------------------------
// SourceProvider implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl SourceProvider for GithubClient {
    async fn last_commit(&self, vcs: &Vcs) -> Result<Commit> {
        let info = vcs.info()?;
        let path = format!("{}/branches/{}", repo_path(&info), info.branch);

        let (status, json) = self.get(vcs, &path, &[]).await?;
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(DockershipError::Source {
                repository: vcs.to_string(),
                message: format!("branch {:?} not found", info.branch),
            });
        }

        json["commit"]["sha"]
            .as_str()
            .map(Commit::new)
            .ok_or_else(|| DockershipError::Source {
                repository: vcs.to_string(),
                message: "branch response has no commit sha".into(),
            })
    }

    async fn file_content(&self, vcs: &Vcs, reference: &str, path: &str) -> Result<Vec<u8>> {
        let info = vcs.info()?;
        let url_path = format!("{}/contents/{}", repo_path(&info), path.trim_start_matches('/'));

        let (status, json) = self.get(vcs, &url_path, &[("ref", reference)]).await?;
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(DockershipError::FileNotFound {
                repository: vcs.to_string(),
                path: path.to_string(),
            });
        }

        let encoded = json["content"].as_str().ok_or_else(|| DockershipError::FileNotFound {
            repository: vcs.to_string(),
            path: path.to_string(),
        })?;

        decode_content(encoded).map_err(|e| DockershipError::Source {
            repository: vcs.to_string(),
            message: format!("invalid content encoding for {path}: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, token: Option<&str>) -> GithubClient {
        GithubClient::new(token.map(String::from)).with_base_url(server.uri())
    }

    #[tokio::test]
    async fn last_commit_reads_branch_head() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/web/branches/production"))
            .and(header("authorization", "token s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "production",
                "commit": { "sha": "0123456789abcdef0123456789abcdef01234567" }
            })))
            .mount(&server)
            .await;

        let commit = client(&server, Some("s3cret"))
            .last_commit(&Vcs::new("git@github.com:acme/web.git!production"))
            .await
            .unwrap();
        assert_eq!(commit.as_str(), "0123456789abcdef0123456789abcdef01234567");
    }

    #[tokio::test]
    async fn missing_branch_is_a_source_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "Branch not found"})))
            .mount(&server)
            .await;

        let err = client(&server, None)
            .last_commit(&Vcs::new("git@github.com:acme/web.git"))
            .await
            .unwrap_err();
        assert!(matches!(err, DockershipError::Source { .. }));
    }

    #[tokio::test]
    async fn file_content_is_decoded_at_reference() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/web/contents/docker/Dockerfile"))
            .and(query_param("ref", "abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "encoding": "base64",
                "content": "RlJPTSBi\nYXNlCg==\n"
            })))
            .mount(&server)
            .await;

        let blob = client(&server, None)
            .file_content(&Vcs::new("git@github.com:acme/web.git"), "abc123", "docker/Dockerfile")
            .await
            .unwrap();
        assert_eq!(blob, b"FROM base\n");
    }

    #[tokio::test]
    async fn absent_file_is_file_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server, None)
            .file_content(&Vcs::new("git@github.com:acme/web.git"), "abc123", "Dockerfile")
            .await
            .unwrap_err();
        assert!(matches!(err, DockershipError::FileNotFound { ref path, .. } if path == "Dockerfile"));
    }

    #[tokio::test]
    async fn server_errors_surface_the_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("x-ratelimit-remaining", "0")
                    .set_body_json(json!({"message": "API rate limit exceeded"})),
            )
            .mount(&server)
            .await;

        let err = client(&server, None)
            .last_commit(&Vcs::new("git@github.com:acme/web.git"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("API rate limit exceeded"));
    }

    #[tokio::test]
    async fn malformed_reference_fails_before_any_request() {
        let err = GithubClient::new(None)
            .last_commit(&Vcs::new("nonsense"))
            .await
            .unwrap_err();
        assert!(matches!(err, DockershipError::MalformedVcs(_)));
    }

    #[test]
    fn decode_ignores_line_breaks() {
        assert_eq!(decode_content("Zm9v\nYmFy\n").unwrap(), b"foobar");
        assert!(decode_content("!!!").is_err());
    }
}
