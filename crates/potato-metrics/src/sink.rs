//! The metrics capability injected into agents and servers.

use chrono::{DateTime, Utc};

/// One observation of a running service on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSample {
    pub node_id: String,
    /// Full image reference as reported by the orchestrator.
    pub image: String,
    pub replicas: u64,
    pub created_at: DateTime<Utc>,
}

/// Receives metric observations.
///
/// Implementations must be cheap and must not block: they are called from
/// the reconciliation loop and from RPC handlers.
pub trait MetricsSink: Send + Sync {
    /// The services running on `node_id` during one reconciliation tick.
    /// Replaces whatever the previous tick reported for that node.
    fn services_observed(&self, node_id: &str, samples: &[ServiceSample]);

    /// A plan request for `node_id` finished with gRPC status `code`.
    fn plan_request(&self, node_id: &str, code: &str);
}

/// Sink that drops every observation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn services_observed(&self, _node_id: &str, _samples: &[ServiceSample]) {}

    fn plan_request(&self, _node_id: &str, _code: &str) {}
}
