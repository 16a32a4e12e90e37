//! Readiness gate — startup barrier in front of the store.
//!
//! The server must not accept traffic until PostgreSQL answers and the
//! schema is current. [`ReadinessGate`] polls a probe on a fixed interval
//! and uses [`StoreError::kind`] to decide between retrying and giving up.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::{Connection, PgConnection, PgPool};
use tracing::{debug, error, info};

use crate::error::{ErrorKind, StoreResult};
use crate::store::PgReleaseStore;

/// Default delay between store probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(300);

/// Polls a store probe until it succeeds or fails fatally.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    interval: Duration,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_INTERVAL)
    }
}

impl ReadinessGate {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Run `probe` until it succeeds. Returns the number of attempts.
    ///
    /// Transient failures (connection refused, server starting up) sleep
    /// for the probe interval and try again. A fatal failure is returned
    /// immediately.
    pub async fn wait<F, Fut>(&self, mut probe: F) -> StoreResult<u32>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<()>>,
    {
        let mut attempts: u32 = 0;
        loop {
            attempts = attempts.saturating_add(1);
            match probe().await {
                Ok(()) => {
                    info!(attempts, "store is ready");
                    return Ok(attempts);
                }
                Err(e) => match e.kind() {
                    ErrorKind::Fatal => {
                        error!(attempts, error = %e, "store probe failed");
                        return Err(e);
                    }
                    kind => {
                        if attempts == 1 {
                            info!(?kind, error = %e, "waiting for store");
                        } else {
                            debug!(attempts, ?kind, error = %e, "store not ready");
                        }
                    }
                },
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

/// Open a single connection and run `SELECT 1`.
pub async fn probe_postgres(database_url: &str) -> StoreResult<()> {
    let mut conn = PgConnection::connect(database_url).await?;
    sqlx::query("SELECT 1").execute(&mut conn).await?;
    conn.close().await?;
    Ok(())
}

/// Apply pending migrations from `path`. Nothing pending is not an error.
pub async fn run_migrations(pool: &PgPool, path: &Path) -> StoreResult<()> {
    let migrator = Migrator::new(path).await?;
    info!(path = %path.display(), available = migrator.iter().count(), "applying migrations");
    migrator.run(pool).await?;
    info!("schema is up to date");
    Ok(())
}

/// Wait for the store, migrate it (unless `migrations` is `None`) and
/// return a pooled store ready for queries.
pub async fn prepare_store(
    database_url: &str,
    migrations: Option<&Path>,
    gate: &ReadinessGate,
) -> StoreResult<PgReleaseStore> {
    gate.wait(|| probe_postgres(database_url)).await?;

    let store = PgReleaseStore::connect_lazy(database_url)?;
    match migrations {
        Some(path) => run_migrations(store.pool(), path).await?,
        None => info!("migrations skipped"),
    }
    Ok(store)
}
