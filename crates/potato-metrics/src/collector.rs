//! Metrics collector — in-process storage behind the `/metrics` endpoint.
//!
//! Keeps one gauge series per service seen in a node's latest tick and one
//! counter per (node, status code) pair. Series are kept in ordered maps so the
//! exposition output is stable between scrapes.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::SecondsFormat;
use tracing::trace;

use crate::prometheus::render_prometheus;
use crate::sink::{MetricsSink, ServiceSample};

/// Label set of a `potato_services_in_flight` series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceLabels {
    pub node_id: String,
    pub service_name: String,
    pub version: String,
    pub replicas: String,
    pub created_at: String,
}

impl ServiceLabels {
    pub fn from_sample(sample: &ServiceSample) -> Self {
        let (service_name, version) = split_image(&sample.image);
        Self {
            node_id: sample.node_id.clone(),
            service_name: service_name.to_string(),
            version: version.to_string(),
            replicas: sample.replicas.to_string(),
            created_at: sample.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Label set of a `potato_plan_requests_total` series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlanRequestLabels {
    pub node_id: String,
    pub code: String,
}

/// Collects metric observations for one process.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    /// Service series → unix time of the last observation.
    services: RwLock<BTreeMap<ServiceLabels, f64>>,
    /// Plan request series → count.
    plan_requests: RwLock<BTreeMap<PlanRequestLabels, u64>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every service series.
    pub fn services(&self) -> Vec<(ServiceLabels, f64)> {
        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        services.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    /// Snapshot of every plan request counter.
    pub fn plan_requests(&self) -> Vec<(PlanRequestLabels, u64)> {
        let requests = self
            .plan_requests
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        requests.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    /// Render all series in Prometheus text format.
    pub fn render(&self) -> String {
        render_prometheus(&self.services(), &self.plan_requests())
    }
}

impl MetricsSink for MetricsCollector {
    fn services_observed(&self, node_id: &str, samples: &[ServiceSample]) {
        let now = epoch_secs_f64();
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        services.retain(|labels, _| labels.node_id != node_id);
        for sample in samples {
            trace!(image = %sample.image, %node_id, "service in flight");
            let mut labels = ServiceLabels::from_sample(sample);
            labels.node_id = node_id.to_string();
            services.insert(labels, now);
        }
    }

    fn plan_request(&self, node_id: &str, code: &str) {
        let labels = PlanRequestLabels {
            node_id: node_id.to_string(),
            code: code.to_string(),
        };
        let mut requests = self
            .plan_requests
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *requests.entry(labels).or_insert(0) += 1;
    }
}

/// Split an image reference into (name, tag). A pinned digest is ignored;
/// a missing tag reads as `latest`.
pub fn split_image(image: &str) -> (&str, &str) {
    let reference = image.split('@').next().unwrap_or(image);
    match reference.rfind(':') {
        Some(i) if !reference[i + 1..].contains('/') => (&reference[..i], &reference[i + 1..]),
        _ => (reference, "latest"),
    }
}

fn epoch_secs_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
