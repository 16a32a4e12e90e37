//! Docker Swarm orchestrator — Engine API over the local Unix socket.
//!
//! Each call opens a fresh connection to the socket, performs one HTTP/1.1
//! exchange with hyper and closes it. Only the handful of endpoints the
//! reconciler needs are covered:
//!
//! | Call | Endpoint |
//! |---|---|
//! | `list` | `GET /services` |
//! | `create` | `POST /services/create` |
//! | `remove` | `DELETE /services/{id}` |
//! | `ensure_swarm` | `GET /swarm`, `POST /swarm/init` |
//!
//! Paths carry no `/vX.Y` prefix, so the engine answers with its own
//! current API version.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use crate::orchestrator::{Orchestrator, OrchestratorError, PortConfig, Workload, WorkloadSpec};

/// Default Engine API socket.
pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

/// Docker Swarm client.
#[derive(Debug, Clone)]
pub struct DockerSwarm {
    socket: PathBuf,
}

impl DockerSwarm {
    /// Client for the engine listening on `socket`. A `unix://` prefix is
    /// accepted.
    pub fn new(socket: &str) -> Self {
        let path = socket.strip_prefix("unix://").unwrap_or(socket);
        Self {
            socket: PathBuf::from(path),
        }
    }

    /// Make sure the engine is a swarm manager.
    ///
    /// Inspects the swarm and, if the engine is not part of one, initialises
    /// a new single-node swarm listening on `listen_addr`. Returns the swarm
    /// (or node) id.
    pub async fn ensure_swarm(&self, listen_addr: &str) -> Result<String, OrchestratorError> {
        let (status, body) = self.request(Method::GET, "/swarm", None).await?;
        if status.is_success() {
            let swarm: SwarmInfo = serde_json::from_slice(&body)?;
            info!(cluster_id = %swarm.id, "connected to swarm cluster");
            return Ok(swarm.id);
        }
        // 503 means "this node is not a swarm manager".
        if status != StatusCode::SERVICE_UNAVAILABLE {
            return Err(api_error(status, &body));
        }

        let init = SwarmInitRequest {
            listen_addr: listen_addr.to_string(),
        };
        let (status, body) = self
            .request(Method::POST, "/swarm/init", Some(serde_json::to_vec(&init)?))
            .await?;
        if !status.is_success() {
            return Err(api_error(status, &body));
        }
        let node_id: String = serde_json::from_slice(&body)?;
        info!(%node_id, %listen_addr, "initialised swarm cluster");
        Ok(node_id)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Bytes), OrchestratorError> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|source| OrchestratorError::Connect {
                endpoint: self.socket.display().to_string(),
                source,
            })?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "docker connection closed with error");
            }
        });

        let req = http::Request::builder()
            .method(method)
            .uri(path)
            .header("host", "docker")
            .header("content-type", "application/json")
            .header("user-agent", "potato-agent/0.1")
            .body(Full::new(Bytes::from(body.unwrap_or_default())))?;

        let resp = sender.send_request(req).await?;
        let status = resp.status();
        let bytes = resp.into_body().collect().await?.to_bytes();
        debug!(%path, %status, "docker api call");
        Ok((status, bytes))
    }
}

#[async_trait]
impl Orchestrator for DockerSwarm {
    async fn list(&self) -> Result<Vec<Workload>, OrchestratorError> {
        let (status, body) = self.request(Method::GET, "/services", None).await?;
        if !status.is_success() {
            return Err(api_error(status, &body));
        }
        let services: Vec<SwarmService> = serde_json::from_slice(&body)?;
        Ok(services
            .into_iter()
            .filter_map(SwarmService::into_workload)
            .collect())
    }

    async fn create(&self, spec: &WorkloadSpec) -> Result<String, OrchestratorError> {
        let body = serde_json::to_vec(&ServiceSpec::from_workload(spec))?;
        let (status, body) = self
            .request(Method::POST, "/services/create", Some(body))
            .await?;
        if !status.is_success() {
            return Err(api_error(status, &body));
        }
        let created: ServiceCreateResponse = serde_json::from_slice(&body)?;
        for warning in created.warnings.iter().flatten() {
            warn!(image = %spec.image, %warning, "docker warning on service create");
        }
        Ok(created.id)
    }

    async fn remove(&self, id: &str) -> Result<(), OrchestratorError> {
        let (status, body) = self
            .request(Method::DELETE, &format!("/services/{id}"), None)
            .await?;
        if !status.is_success() {
            return Err(api_error(status, &body));
        }
        Ok(())
    }
}

/// Turn a non-2xx response into an error, using Docker's `message` field
/// when present.
fn api_error(status: StatusCode, body: &[u8]) -> OrchestratorError {
    let message = serde_json::from_slice::<ApiMessage>(body)
        .map(|m| m.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());
    OrchestratorError::Api {
        status: status.as_u16(),
        message,
    }
}

/// Drop a pinned digest (`image@sha256:...`) so the reference compares
/// against the image requested in the plan.
pub fn strip_digest(image: &str) -> &str {
    image.split('@').next().unwrap_or(image)
}

// ── Engine API types ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SwarmInfo {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmInitRequest {
    listen_addr: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwarmService {
    #[serde(rename = "ID")]
    id: String,
    created_at: DateTime<Utc>,
    spec: ServiceSpec,
}

impl SwarmService {
    /// `None` for services that do not run a container image, such as
    /// plugin services.
    fn into_workload(self) -> Option<Workload> {
        let Some(container) = self.spec.task_template.container_spec else {
            debug!(id = %self.id, "skipping service without a container spec");
            return None;
        };
        let replicas = self
            .spec
            .mode
            .replicated
            .and_then(|r| r.replicas)
            .unwrap_or(0);
        Some(Workload {
            id: self.id,
            image: strip_digest(&container.image).to_string(),
            replicas,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceSpec {
    task_template: TaskTemplate,
    #[serde(default)]
    mode: ServiceMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    endpoint_spec: Option<EndpointSpec>,
}

impl ServiceSpec {
    fn from_workload(spec: &WorkloadSpec) -> Self {
        Self {
            task_template: TaskTemplate {
                container_spec: Some(ContainerSpec {
                    image: spec.image.clone(),
                }),
            },
            mode: ServiceMode {
                replicated: Some(Replicated {
                    replicas: Some(spec.replicas),
                }),
            },
            endpoint_spec: Some(EndpointSpec {
                ports: spec.ports.iter().map(EndpointPort::from).collect(),
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TaskTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    container_spec: Option<ContainerSpec>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerSpec {
    image: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceMode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    replicated: Option<Replicated>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Replicated {
    #[serde(default)]
    replicas: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EndpointSpec {
    #[serde(default)]
    ports: Vec<EndpointPort>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EndpointPort {
    protocol: String,
    target_port: u32,
    published_port: u32,
}

impl From<&PortConfig> for EndpointPort {
    fn from(p: &PortConfig) -> Self {
        Self {
            protocol: p.protocol.clone(),
            target_port: p.target_port,
            published_port: p.published_port,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceCreateResponse {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    warnings: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    const SERVICES_JSON: &str = r#"[
      {
        "ID": "9mnpnzenvg8p8tdbtq4wvbkcz",
        "Version": {"Index": 19},
        "CreatedAt": "2016-06-07T21:05:51.880065305Z",
        "UpdatedAt": "2016-06-07T21:07:29.962229872Z",
        "Spec": {
          "Name": "hopeful_cori",
          "TaskTemplate": {
            "ContainerSpec": {"Image": "redis:7@sha256:0123abcd"}
          },
          "Mode": {"Replicated": {"Replicas": 3}},
          "EndpointSpec": {"Mode": "vip", "Ports": [
            {"Protocol": "tcp", "TargetPort": 6379, "PublishedPort": 30001}
          ]}
        }
      },
      {
        "ID": "global1",
        "CreatedAt": "2020-01-01T00:00:00Z",
        "Spec": {
          "TaskTemplate": {"ContainerSpec": {"Image": "agent:v1"}},
          "Mode": {"Global": {}}
        }
      }
    ]"#;

    #[test]
    fn decode_service_list() {
        let services: Vec<SwarmService> = serde_json::from_str(SERVICES_JSON).unwrap();
        let workloads: Vec<Workload> =
            services.into_iter().filter_map(SwarmService::into_workload).collect();

        assert_eq!(workloads.len(), 2);
        assert_eq!(workloads[0].id, "9mnpnzenvg8p8tdbtq4wvbkcz");
        assert_eq!(workloads[0].image, "redis:7");
        assert_eq!(workloads[0].replicas, 3);
        assert_eq!(workloads[0].created_at.to_rfc3339(), "2016-06-07T21:05:51.880065305+00:00");

        // Global services report no replica count.
        assert_eq!(workloads[1].replicas, 0);
    }

    #[test]
    fn plugin_service_is_skipped_not_fatal() {
        let body = r#"[
          {
            "ID": "web1",
            "CreatedAt": "2024-01-01T00:00:00Z",
            "Spec": {
              "TaskTemplate": {"ContainerSpec": {"Image": "web:v1"}},
              "Mode": {"Replicated": {"Replicas": 1}}
            }
          },
          {
            "ID": "plugin1",
            "CreatedAt": "2024-01-01T00:00:00Z",
            "Spec": {
              "TaskTemplate": {
                "PluginSpec": {"Name": "vieux/sshfs", "Remote": "vieux/sshfs:latest"},
                "Runtime": "plugin"
              },
              "Mode": {"Global": {}}
            }
          }
        ]"#;
        let services: Vec<SwarmService> = serde_json::from_str(body).unwrap();
        let workloads: Vec<Workload> =
            services.into_iter().filter_map(SwarmService::into_workload).collect();

        assert_eq!(workloads.len(), 1);
        assert_eq!(workloads[0].id, "web1");
        assert_eq!(workloads[0].image, "web:v1");
    }

    #[test]
    fn encode_create_body() {
        let spec = WorkloadSpec {
            image: "web:v1".to_string(),
            replicas: 2,
            ports: vec![PortConfig {
                protocol: "tcp".to_string(),
                target_port: 9000,
                published_port: 80,
            }],
        };
        let json = serde_json::to_value(ServiceSpec::from_workload(&spec)).unwrap();
        assert_eq!(json["TaskTemplate"]["ContainerSpec"]["Image"], "web:v1");
        assert_eq!(json["Mode"]["Replicated"]["Replicas"], 2);
        assert_eq!(json["EndpointSpec"]["Ports"][0]["TargetPort"], 9000);
        assert_eq!(json["EndpointSpec"]["Ports"][0]["PublishedPort"], 80);
        assert_eq!(json["EndpointSpec"]["Ports"][0]["Protocol"], "tcp");
    }

    #[test]
    fn strip_digest_keeps_tag() {
        assert_eq!(strip_digest("web:v1@sha256:ff"), "web:v1");
        assert_eq!(strip_digest("web:v1"), "web:v1");
    }

    #[test]
    fn api_error_prefers_message_field() {
        let err = api_error(StatusCode::NOT_FOUND, br#"{"message":"service x not found"}"#);
        match err {
            OrchestratorError::Api { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "service x not found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unix_prefix_is_stripped() {
        let docker = DockerSwarm::new("unix:///var/run/docker.sock");
        assert_eq!(docker.socket, PathBuf::from("/var/run/docker.sock"));
    }

    /// Serve one canned HTTP response on a Unix socket and return the
    /// request line the client sent.
    async fn fake_engine(
        listener: UnixListener,
        status_line: &'static str,
        body: &'static str,
    ) -> String {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let response = format!(
            "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await.unwrap();
        let text = String::from_utf8_lossy(&buf).to_string();
        text.lines().next().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn list_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docker.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let engine = tokio::spawn(fake_engine(listener, "200 OK", SERVICES_JSON));

        let docker = DockerSwarm::new(path.to_str().unwrap());
        let workloads = docker.list().await.unwrap();
        assert_eq!(workloads.len(), 2);

        let request_line = engine.await.unwrap();
        assert_eq!(request_line, "GET /services HTTP/1.1");
    }

    #[tokio::test]
    async fn remove_reports_api_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docker.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let engine = tokio::spawn(fake_engine(
            listener,
            "404 Not Found",
            r#"{"message":"service abc not found"}"#,
        ));

        let docker = DockerSwarm::new(path.to_str().unwrap());
        let err = docker.remove("abc").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Api { status: 404, .. }));

        let request_line = engine.await.unwrap();
        assert_eq!(request_line, "DELETE /services/abc HTTP/1.1");
    }

    #[tokio::test]
    async fn ensure_swarm_uses_unversioned_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docker.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let engine = tokio::spawn(fake_engine(listener, "200 OK", r#"{"ID":"swarm-abc"}"#));

        let docker = DockerSwarm::new(&format!("unix://{}", path.display()));
        let id = docker.ensure_swarm("0.0.0.0:2377").await.unwrap();
        assert_eq!(id, "swarm-abc");

        let request_line = engine.await.unwrap();
        assert_eq!(request_line, "GET /swarm HTTP/1.1");
    }

    #[tokio::test]
    async fn missing_socket_is_a_connect_error() {
        let docker = DockerSwarm::new("/nonexistent/potato/docker.sock");
        let err = docker.list().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Connect { .. }));
    }
}
