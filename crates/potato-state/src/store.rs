//! Release stores — where the plan server reads desired state from.
//!
//! [`PgReleaseStore`] is the production backend: a sqlx connection pool
//! over the `releases` table. The pool is shared across concurrent RPCs;
//! sqlx handles connection checkout, so the store holds no lock of its own.
//! [`MemoryReleaseStore`] keeps rows in memory with the same ordering
//! contract (for testing and local runs).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StoreResult;
use crate::types::Release;

const SELECT_RELEASES_FOR_HOST: &str = "\
    SELECT hostname, version, ports, replicas, created_at \
    FROM releases \
    WHERE hostname = $1 \
    ORDER BY created_at DESC";

/// Read access to release rows.
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    /// Every release row for `hostname`, newest first. Rows are not
    /// deduplicated by image.
    async fn releases_for_host(&self, hostname: &str) -> StoreResult<Vec<Release>>;
}

// ── PostgreSQL ─────────────────────────────────────────────────────

/// PostgreSQL-backed release store.
#[derive(Clone)]
pub struct PgReleaseStore {
    pool: PgPool,
}

impl PgReleaseStore {
    /// Build a store whose pool connects on first use.
    pub fn connect_lazy(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ReleaseStore for PgReleaseStore {
    async fn releases_for_host(&self, hostname: &str) -> StoreResult<Vec<Release>> {
        let rows = sqlx::query_as::<_, Release>(SELECT_RELEASES_FOR_HOST)
            .bind(hostname)
            .fetch_all(&self.pool)
            .await?;
        debug!(%hostname, rows = rows.len(), "releases loaded");
        Ok(rows)
    }
}

// ── In-memory ──────────────────────────────────────────────────────

/// In-memory release store.
#[derive(Clone, Default)]
pub struct MemoryReleaseStore {
    rows: Arc<RwLock<Vec<Release>>>,
}

impl MemoryReleaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with rows.
    pub fn with_releases(rows: Vec<Release>) -> Self {
        Self {
            rows: Arc::new(RwLock::new(rows)),
        }
    }

    /// Append a release row.
    pub async fn insert(&self, release: Release) {
        self.rows.write().await.push(release);
    }
}

#[async_trait]
impl ReleaseStore for MemoryReleaseStore {
    async fn releases_for_host(&self, hostname: &str) -> StoreResult<Vec<Release>> {
        let rows = self.rows.read().await;
        let mut matching: Vec<Release> = rows
            .iter()
            .filter(|r| r.hostname == hostname)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching)
    }
}
