//! Docker Engine API client.
//!
//! Endpoints are `unix:///path/to/docker.sock`, `tcp://host:port` or
//! `http(s)://host:port`. With a cert directory, `tcp://` is spoken over TLS
//! using `cert.pem`, `key.pem` and `ca.pem` from that directory.
//!
//! Host settings (ports, links, restart policy, volumes-from) are sent with
//! `create`; current engines reject them on `start`, so `start` posts no body.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use dockership_core::{ContainerSpec, Engine, HostConfig, OutputSink};
use dockership_types::{Container, DockershipError, Image, ImageId, PortMapping, Result};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiContainer {
    id: String,
    image: String,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    ports: Vec<ApiPort>,
}

#[derive(Debug, Deserialize)]
struct ApiPort {
    #[serde(rename = "IP", default)]
    ip: String,
    #[serde(rename = "PrivatePort", default)]
    private_port: u16,
    #[serde(rename = "PublicPort", default)]
    public_port: u16,
    #[serde(rename = "Type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiImage {
    id: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    #[serde(default)]
    created: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreatedContainer {
    id: String,
}

/// One line of the build progress stream.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BuildMessage {
    stream: Option<String>,
    status: Option<String>,
    error: Option<String>,
}

// ---------------------------------------------------------------------------
// DockerHttpEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DockerHttpEngine {
    client: reqwest::Client,
    endpoint: String,
    base_url: String,
}

impl DockerHttpEngine {
    pub fn new(endpoint: &str) -> Result<Self> {
        Self::connect(endpoint, None)
    }

    /// Build a dedicated client for `endpoint`, bound to its socket when it is
    /// a `unix://` endpoint and presenting the client certificate found in
    /// `cert_path` when one is given.
    pub fn connect(endpoint: &str, cert_path: Option<&Path>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(dir) = cert_path {
            let (identity, ca) = load_tls(dir)?;
            builder = builder.identity(identity).add_root_certificate(ca);
        }
        if let Some(socket) = endpoint.strip_prefix(UNIX_SCHEME) {
            builder = bind_unix_socket(builder, socket)?;
        }

        let client = builder
            .build()
            .map_err(|e| DockershipError::Config(format!("docker client for {endpoint}: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            base_url: base_url(endpoint, cert_path.is_some())?,
        })
    }

    /// Reuse `client` as-is. Unix endpoints and TLS need [`Self::connect`].
    pub fn with_client(client: reqwest::Client, endpoint: &str) -> Result<Self> {
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            base_url: base_url(endpoint, false)?,
        })
    }

    /// Whether `endpoint` needs its own client rather than a shared pool.
    pub fn needs_dedicated_client(endpoint: &str, cert_path: Option<&Path>) -> bool {
        cert_path.is_some() || endpoint.starts_with(UNIX_SCHEME)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let resp = request
            .send()
            .await
            .map_err(|e| DockershipError::engine(operation, e))?;

        let status = resp.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        Err(map_error(operation, status, &body))
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        self.send(operation, request)
            .await?
            .json()
            .await
            .map_err(|e| DockershipError::engine(operation, format!("invalid response: {e}")))
    }
}

const UNIX_SCHEME: &str = "unix://";

// Requests over a unix socket still need an authority; the engine ignores it.
const UNIX_BASE_URL: &str = "http://localhost";

fn base_url(endpoint: &str, tls: bool) -> Result<String> {
    if endpoint.starts_with(UNIX_SCHEME) {
        return Ok(UNIX_BASE_URL.to_string());
    }

    let trimmed = endpoint.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("tcp://") {
        let scheme = if tls { "https" } else { "http" };
        return Ok(format!("{scheme}://{rest}"));
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Ok(trimmed.to_string());
    }

    Err(DockershipError::Config(format!(
        "unsupported docker endpoint {endpoint:?}, expected unix://, tcp:// or http(s)://"
    )))
}

#[cfg(unix)]
fn bind_unix_socket(builder: reqwest::ClientBuilder, socket: &str) -> Result<reqwest::ClientBuilder> {
    Ok(builder.unix_socket(std::path::PathBuf::from(socket)))
}

#[cfg(not(unix))]
fn bind_unix_socket(_builder: reqwest::ClientBuilder, socket: &str) -> Result<reqwest::ClientBuilder> {
    Err(DockershipError::Config(format!(
        "unix socket {socket} is not supported on this platform"
    )))
}

fn read_pem(dir: &Path, name: &str) -> Result<Vec<u8>> {
    let path = dir.join(name);
    std::fs::read(&path).map_err(|e| DockershipError::Config(format!("reading {}: {e}", path.display())))
}

/// Client identity from `cert.pem` + `key.pem` and the CA from `ca.pem`.
fn load_tls(dir: &Path) -> Result<(reqwest::Identity, reqwest::Certificate)> {
    let mut identity = read_pem(dir, "cert.pem")?;
    identity.push(b'\n');
    identity.extend(read_pem(dir, "key.pem")?);
    let ca = read_pem(dir, "ca.pem")?;

    let invalid = |name: &str, e: reqwest::Error| {
        DockershipError::Config(format!("invalid TLS material in {}: {name}: {e}", dir.display()))
    };
    let identity = reqwest::Identity::from_pem(&identity).map_err(|e| invalid("cert.pem/key.pem", e))?;
    let ca = reqwest::Certificate::from_pem(&ca).map_err(|e| invalid("ca.pem", e))?;
    Ok((identity, ca))
}

fn map_error(operation: &str, status: reqwest::StatusCode, body: &str) -> DockershipError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["message"].as_str().map(String::from))
        .unwrap_or_else(|| body.trim().to_string());
    DockershipError::engine(operation, format!("{}: {message}", status.as_u16()))
}

fn host_config_body(host: &HostConfig) -> serde_json::Value {
    let port_bindings: BTreeMap<&str, Vec<serde_json::Value>> = host
        .port_bindings
        .iter()
        .map(|(port, bindings)| {
            let bindings = bindings
                .iter()
                .map(|b| json!({ "HostIp": b.host_ip, "HostPort": b.host_port }))
                .collect();
            (port.as_str(), bindings)
        })
        .collect();

    json!({
        "PortBindings": port_bindings,
        "Links": host.links,
        "RestartPolicy": {
            "Name": host.restart_policy.name(),
            "MaximumRetryCount": host.restart_policy.max_retry_count(),
        },
        "VolumesFrom": host.volumes_from,
    })
}

fn create_body(spec: &ContainerSpec) -> serde_json::Value {
    let volumes: BTreeMap<&str, serde_json::Value> = spec
        .volumes
        .iter()
        .map(|v| (v.as_str(), json!({})))
        .collect();
    let exposed: BTreeMap<&str, serde_json::Value> = spec
        .host_config
        .port_bindings
        .keys()
        .map(|k| (k.as_str(), json!({})))
        .collect();

    json!({
        "Image": spec.image.as_str(),
        "Volumes": volumes,
        "ExposedPorts": exposed,
        "HostConfig": host_config_body(&spec.host_config),
    })
}

/// Forward complete lines of the build stream to `output`; returns the
/// first error message the engine reported.
fn drain_build_lines(buffer: &mut Vec<u8>, endpoint: &str, output: &OutputSink) -> Option<String> {
    let mut error = None;
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<BuildMessage>(line) {
            Ok(msg) => {
                if let Some(err) = msg.error {
                    output.write(endpoint, err.trim_end());
                    error.get_or_insert(err);
                } else if let Some(text) = msg.stream.or(msg.status) {
                    output.write(endpoint, text.trim_end());
                }
            }
            Err(_) => output.write(endpoint, line),
        }
    }
    error
}

// ---------------------------------------------------------------------------
// Engine implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Engine for DockerHttpEngine {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn list_containers(&self) -> Result<Vec<Container>> {
        let request = self
            .client
            .get(self.url("/containers/json"))
            .query(&[("all", "1")]);
        let containers: Vec<ApiContainer> = self.send_json("list_containers", request).await?;

        Ok(containers
            .into_iter()
            .map(|c| Container {
                endpoint: self.endpoint.clone(),
                id: c.id,
                image: ImageId::new(c.image),
                names: c.names,
                status: c.status,
                created: c.created,
                ports: c
                    .ports
                    .into_iter()
                    .map(|p| PortMapping {
                        ip: p.ip,
                        private_port: p.private_port,
                        public_port: p.public_port,
                        kind: p.kind,
                    })
                    .collect(),
            })
            .collect())
    }

    async fn list_images(&self) -> Result<Vec<Image>> {
        let request = self.client.get(self.url("/images/json"));
        let images: Vec<ApiImage> = self.send_json("list_images", request).await?;

        Ok(images
            .into_iter()
            .map(|i| Image {
                endpoint: self.endpoint.clone(),
                id: i.id,
                repo_tags: i.repo_tags.unwrap_or_default(),
                created: i.created,
            })
            .collect())
    }

    async fn build_image(
        &self,
        tag: &ImageId,
        context: Vec<u8>,
        no_cache: bool,
        output: &OutputSink,
    ) -> Result<()> {
        let mut query = vec![("t", tag.as_str())];
        if no_cache {
            query.push(("nocache", "1"));
            query.push(("rm", "1"));
        }

        let request = self
            .client
            .post(self.url("/build"))
            .query(&query)
            .header("content-type", "application/x-tar")
            .body(context);
        let mut resp = self.send("build", request).await?;

        let mut buffer = Vec::new();
        let mut failure = None;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| DockershipError::engine("build", e))?
        {
            buffer.extend_from_slice(&chunk);
            if let Some(err) = drain_build_lines(&mut buffer, &self.endpoint, output) {
                failure.get_or_insert(err);
            }
        }
        buffer.push(b'\n');
        if let Some(err) = drain_build_lines(&mut buffer, &self.endpoint, output) {
            failure.get_or_insert(err);
        }

        match failure {
            Some(err) => Err(DockershipError::engine("build", err.trim_end())),
            None => Ok(()),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let request = self
            .client
            .post(self.url("/containers/create"))
            .query(&[("name", spec.name.as_str())])
            .json(&create_body(spec));
        let created: CreatedContainer = self.send_json("create", request).await?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str, _host_config: &HostConfig) -> Result<()> {
        let request = self.client.post(self.url(&format!("/containers/{id}/start")));
        self.send("start", request).await.map(|_| ())
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        let request = self.client.post(self.url(&format!("/containers/{id}/kill")));
        self.send("kill", request).await.map(|_| ())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let request = self.client.delete(self.url(&format!("/containers/{id}")));
        self.send("remove_container", request).await.map(|_| ())
    }

    async fn remove_image(&self, id: &str) -> Result<()> {
        let request = self.client.delete(self.url(&format!("/images/{id}")));
        self.send("remove_image", request).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockership_core::HostBinding;
    use dockership_types::RestartPolicy;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn engine(server: &MockServer) -> DockerHttpEngine {
        DockerHttpEngine::new(&server.uri()).unwrap()
    }

    #[test]
    fn endpoint_schemes() {
        assert_eq!(base_url("tcp://10.0.0.1:2375", false).unwrap(), "http://10.0.0.1:2375");
        assert_eq!(base_url("tcp://10.0.0.1:2376", true).unwrap(), "https://10.0.0.1:2376");
        assert_eq!(base_url("https://docker.local/", false).unwrap(), "https://docker.local");
        assert_eq!(base_url("unix:///var/run/docker.sock", false).unwrap(), UNIX_BASE_URL);
        assert!(base_url("ssh://docker.local", false).is_err());
    }

    #[test]
    fn dedicated_clients_for_sockets_and_certs() {
        assert!(!DockerHttpEngine::needs_dedicated_client("tcp://a:2375", None));
        assert!(DockerHttpEngine::needs_dedicated_client("unix:///var/run/docker.sock", None));
        assert!(DockerHttpEngine::needs_dedicated_client("tcp://a:2376", Some(Path::new("/certs"))));
    }

    #[test]
    fn missing_cert_files_are_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = DockerHttpEngine::connect("tcp://a:2376", Some(dir.path())).unwrap_err();
        assert!(matches!(&err, DockershipError::Config(msg) if msg.contains("cert.pem")));

        for name in ["cert.pem", "key.pem", "ca.pem"] {
            std::fs::write(dir.path().join(name), "not pem").unwrap();
        }
        let err = DockerHttpEngine::connect("tcp://a:2376", Some(dir.path())).unwrap_err();
        assert!(matches!(&err, DockershipError::Config(msg) if msg.contains("invalid TLS material")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_socket_endpoints_are_reachable() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("docker.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let body = r#"[{"Id":"abc","Image":"web:r1","Names":["/web"],"Status":"Up 1 second"}]"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });

        let endpoint = format!("unix://{}", socket.display());
        let engine = DockerHttpEngine::new(&endpoint).unwrap();
        let containers = engine.list_containers().await.unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].endpoint, endpoint);
        assert!(containers[0].belongs_to("web"));

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /containers/json?all=1 HTTP/1.1"));
    }

    #[tokio::test]
    async fn list_containers_maps_engine_records() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/containers/json"))
            .and(query_param("all", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "Id": "0123456789abcdef",
                "Image": "web:abc123",
                "Names": ["/web"],
                "Status": "Up 2 hours",
                "Created": 1700000000,
                "Ports": [{"IP": "0.0.0.0", "PrivatePort": 8080, "PublicPort": 80, "Type": "tcp"}]
            }])))
            .mount(&server)
            .await;

        let e = engine(&server);
        let containers = e.list_containers().await.unwrap();
        assert_eq!(containers.len(), 1);
        let c = &containers[0];
        assert_eq!(c.endpoint, server.uri());
        assert!(c.is_running());
        assert!(c.belongs_to("web"));
        assert_eq!(c.ports_string(), "0.0.0.0:80->8080/tcp");
    }

    #[tokio::test]
    async fn list_images_tolerates_null_tags() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/images/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"Id": "sha256:aaa", "RepoTags": ["web:abc123"], "Created": 2},
                {"Id": "sha256:bbb", "RepoTags": null, "Created": 1}
            ])))
            .mount(&server)
            .await;

        let images = engine(&server).list_images().await.unwrap();
        assert_eq!(images.len(), 2);
        assert!(images[0].belongs_to("web"));
        assert!(images[1].repo_tags.is_empty());
    }

    #[tokio::test]
    async fn build_streams_output_and_reports_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/build"))
            .and(query_param("t", "web:abc123"))
            .and(header("content-type", "application/x-tar"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "{\"stream\":\"Step 1/2 : FROM base\\n\"}\r\n{\"stream\":\"Step 2/2 : RUN false\\n\"}\r\n{\"error\":\"The command returned a non-zero code: 1\"}\r\n",
            ))
            .mount(&server)
            .await;

        let (sink, mut rx) = OutputSink::channel();
        let err = engine(&server)
            .build_image(&ImageId::new("web:abc123"), b"tar".to_vec(), false, &sink)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("non-zero code"));
        assert_eq!(rx.recv().await.unwrap().line, "Step 1/2 : FROM base");
        assert_eq!(rx.recv().await.unwrap().line, "Step 2/2 : RUN false");
    }

    #[tokio::test]
    async fn build_with_no_cache_sets_flags() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/build"))
            .and(query_param("nocache", "1"))
            .and(query_param("rm", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("{\"stream\":\"Successfully built 0123456789ab\\n\"}"),
            )
            .expect(1)
            .mount(&server)
            .await;

        engine(&server)
            .build_image(&ImageId::new("web:abc123"), vec![], true, &OutputSink::discard())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_sends_host_settings() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/containers/create"))
            .and(query_param("name", "web"))
            .and(body_partial_json(json!({
                "Image": "web:abc123",
                "Volumes": {"/data": {}},
                "HostConfig": {
                    "PortBindings": {"8080/tcp": [{"HostIp": "0.0.0.0", "HostPort": "80"}]},
                    "Links": ["db:database"],
                    "RestartPolicy": {"Name": "on-failure", "MaximumRetryCount": 3},
                    "VolumesFrom": ["storage"]
                }
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"Id": "newid", "Warnings": []})))
            .mount(&server)
            .await;

        let mut port_bindings = BTreeMap::new();
        port_bindings.insert(
            "8080/tcp".to_string(),
            vec![HostBinding {
                host_ip: "0.0.0.0".into(),
                host_port: "80".into(),
            }],
        );
        let spec = ContainerSpec {
            name: "web".into(),
            image: ImageId::new("web:abc123"),
            volumes: vec!["/data".into()],
            host_config: HostConfig {
                port_bindings,
                links: vec!["db:database".into()],
                restart_policy: RestartPolicy::OnFailure(3),
                volumes_from: vec!["storage".into()],
            },
        };

        let id = engine(&server).create_container(&spec).await.unwrap();
        assert_eq!(id, "newid");
    }

    #[tokio::test]
    async fn lifecycle_calls_hit_the_right_paths() {
        let server = MockServer::start().await;
        for (verb, route, status) in [
            ("POST", "/containers/abc/start", 204),
            ("POST", "/containers/abc/kill", 204),
            ("DELETE", "/containers/abc", 204),
            ("DELETE", "/images/sha256:aaa", 200),
        ] {
            Mock::given(method(verb))
                .and(path(route))
                .respond_with(ResponseTemplate::new(status))
                .expect(1)
                .mount(&server)
                .await;
        }

        let e = engine(&server);
        e.start_container("abc", &HostConfig::default()).await.unwrap();
        e.kill_container("abc").await.unwrap();
        e.remove_container("abc").await.unwrap();
        e.remove_image("sha256:aaa").await.unwrap();
    }

    #[tokio::test]
    async fn engine_errors_carry_operation_and_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/containers/create"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "message": "Conflict. The container name \"/web\" is already in use"
            })))
            .mount(&server)
            .await;

        let spec = ContainerSpec {
            name: "web".into(),
            image: ImageId::new("web:abc123"),
            volumes: vec![],
            host_config: HostConfig::default(),
        };
        let err = engine(&server).create_container(&spec).await.unwrap_err();
        match err {
            DockershipError::Engine { operation, message } => {
                assert_eq!(operation, "create");
                assert!(message.starts_with("409: Conflict."));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
