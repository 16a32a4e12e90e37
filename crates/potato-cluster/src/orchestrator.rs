//! Orchestrator capability — list, create and remove running workloads.
//!
//! The reconciler only ever talks to this trait. [`crate::docker::DockerSwarm`]
//! is the production implementation; tests use in-memory fakes.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use potato_state::Service;

/// A workload currently running on the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    /// Orchestrator-assigned identifier. Removal is keyed by this, not by image.
    pub id: String,
    pub image: String,
    pub replicas: u64,
    pub created_at: DateTime<Utc>,
}

/// A published port on a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    pub protocol: String,
    pub target_port: u32,
    pub published_port: u32,
}

/// Everything needed to start a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub image: String,
    pub replicas: u64,
    pub ports: Vec<PortConfig>,
}

impl WorkloadSpec {
    /// Build a spec from a planned service, parsing its port specs.
    pub fn from_service(service: &Service) -> Result<Self, PortSpecError> {
        Ok(Self {
            image: service.image.clone(),
            replicas: service.replicas,
            ports: parse_ports(&service.ports)?,
        })
    }
}

/// A port spec that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortSpecError {
    #[error("failed to parse target port {value:?} in {spec:?}")]
    Target { spec: String, value: String },

    #[error("failed to parse published port {value:?} in {spec:?}")]
    Published { spec: String, value: String },
}

/// Parse `"target"` or `"target:published"`.
///
/// Returns `Ok(None)` for an empty spec. Segments after the second `:` are
/// ignored.
pub fn parse_port_spec(spec: &str) -> Result<Option<PortConfig>, PortSpecError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Ok(None);
    }

    let mut parts = spec.split(':');
    let target = parts.next().unwrap_or_default();
    let published = parts.next().unwrap_or(target);

    let target_port = target.parse::<u32>().map_err(|_| PortSpecError::Target {
        spec: spec.to_string(),
        value: target.to_string(),
    })?;
    let published_port = published
        .parse::<u32>()
        .map_err(|_| PortSpecError::Published {
            spec: spec.to_string(),
            value: published.to_string(),
        })?;

    Ok(Some(PortConfig {
        protocol: "tcp".to_string(),
        target_port,
        published_port,
    }))
}

/// Parse every spec, skipping empty ones. The first malformed spec fails
/// the whole list.
pub fn parse_ports(specs: &[String]) -> Result<Vec<PortConfig>, PortSpecError> {
    let mut ports = Vec::with_capacity(specs.len());
    for spec in specs {
        if let Some(port) = parse_port_spec(spec)? {
            ports.push(port);
        }
    }
    Ok(ports)
}

/// Errors from an orchestrator call.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("cannot reach orchestrator at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] http::Error),

    #[error("orchestrator returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("failed to decode orchestrator response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid port spec: {0}")]
    Port(#[from] PortSpecError),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

/// Local container orchestrator.
///
/// Calls are issued from the single reconciliation loop only, so
/// implementations need no internal locking for ordering.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Every workload currently running.
    async fn list(&self) -> Result<Vec<Workload>, OrchestratorError>;

    /// Start a workload. Returns the new workload id.
    async fn create(&self, spec: &WorkloadSpec) -> Result<String, OrchestratorError>;

    /// Stop and remove the workload with the given id.
    async fn remove(&self, id: &str) -> Result<(), OrchestratorError>;
}
