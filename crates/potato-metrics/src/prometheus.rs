//! Prometheus text exposition format.
//!
//! Renders collector snapshots into the text format scraped by a
//! Prometheus server or compatible agent.

use std::fmt::Write;

use crate::collector::{PlanRequestLabels, ServiceLabels};

/// Render service gauges and plan request counters.
///
/// HELP/TYPE lines are always emitted, even with no samples.
pub fn render_prometheus(
    services: &[(ServiceLabels, f64)],
    plan_requests: &[(PlanRequestLabels, u64)],
) -> String {
    let mut out = String::new();

    out.push_str(
        "# HELP potato_services_in_flight A gauge of services currently being served by the potato agent.\n",
    );
    out.push_str("# TYPE potato_services_in_flight gauge\n");
    for (l, value) in services {
        let _ = writeln!(
            out,
            "potato_services_in_flight{{node_id=\"{}\",service_name=\"{}\",version=\"{}\",replicas=\"{}\",created_at=\"{}\"}} {:.3}",
            escape(&l.node_id),
            escape(&l.service_name),
            escape(&l.version),
            escape(&l.replicas),
            escape(&l.created_at),
            value
        );
    }

    out.push_str("# HELP potato_plan_requests_total Plan requests served, by status code.\n");
    out.push_str("# TYPE potato_plan_requests_total counter\n");
    for (l, count) in plan_requests {
        let _ = writeln!(
            out,
            "potato_plan_requests_total{{node_id=\"{}\",code=\"{}\"}} {}",
            escape(&l.node_id),
            escape(&l.code),
            count
        );
    }

    out
}

/// Escape a label value: backslash, double quote and newline.
fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}
