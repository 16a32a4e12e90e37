//! Domain types for the desired-state store.
//!
//! A [`Release`] is one row of the `releases` table. The plan server maps
//! every row to a [`Service`] and hands the ordered list back to the agent
//! as a [`Plan`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a node. Defaults to the host name on the agent side.
pub type NodeId = String;

/// Separator between port specs in the `releases.ports` column.
pub const PORT_SEPARATOR: char = ';';

// ── Release ────────────────────────────────────────────────────────

/// One row of the `releases` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Release {
    pub hostname: String,
    /// Container image reference, e.g. `registry/web:v1`.
    pub version: String,
    /// `;`-delimited port specs (`"8080;9000:80"`).
    pub ports: String,
    pub replicas: i32,
    pub created_at: DateTime<Utc>,
}

impl Release {
    /// Map the row to the service the node should run.
    ///
    /// Empty port segments are dropped; a negative replica count is clamped
    /// to zero.
    pub fn to_service(&self) -> Service {
        Service {
            image: self.version.clone(),
            replicas: u64::try_from(self.replicas).unwrap_or(0),
            ports: split_ports(&self.ports),
        }
    }
}

/// Split a `;`-delimited port column into individual specs.
pub fn split_ports(ports: &str) -> Vec<String> {
    ports
        .split(PORT_SEPARATOR)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Plan ───────────────────────────────────────────────────────────

/// A service a node should run. Identity is the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub image: String,
    pub replicas: u64,
    pub ports: Vec<String>,
}

/// Desired-state snapshot for one node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Plan {
    pub node_id: NodeId,
    pub services: Vec<Service>,
}

impl Plan {
    /// Build a plan from release rows, keeping their order.
    pub fn from_releases(node_id: &str, releases: &[Release]) -> Self {
        Self {
            node_id: node_id.to_string(),
            services: releases.iter().map(Release::to_service).collect(),
        }
    }
}
