//! potato-metrics — observability for Potato agents and servers.
//!
//! Nothing here is process-global: a [`MetricsCollector`] is created by the
//! binary and handed to the reconciler and the plan server as an
//! `Arc<dyn MetricsSink>`. Tests substitute their own sink.
//!
//! # Architecture
//!
//! ```text
//! MetricsSink (trait)
//!   ├── services_observed() ← once per tick, with every running service
//!   └── plan_request()      ← once per GetStatus call
//!
//! MetricsCollector: MetricsSink
//!   └── render() → Prometheus text for the /metrics endpoint
//! ```

pub mod collector;
pub mod http;
pub mod prometheus;
pub mod sink;

pub use collector::{MetricsCollector, PlanRequestLabels, ServiceLabels};
pub use http::metrics_router;
pub use prometheus::render_prometheus;
pub use sink::{MetricsSink, NoopSink, ServiceSample};
