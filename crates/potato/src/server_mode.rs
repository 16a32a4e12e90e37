//! Server mode — serves plans from the release store.
//!
//! Waits for PostgreSQL to accept connections, applies migrations, then
//! serves gRPC and `/metrics` on the listen address.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use potato_cluster::{PlanServer, RunGroup, serve};
use potato_metrics::MetricsCollector;
use potato_state::{ReadinessGate, prepare_store};

use crate::Opts;

/// Run the plan server until interrupted or a component fails.
pub async fn run_server(opts: &Opts) -> anyhow::Result<()> {
    let database_url = opts
        .database_url
        .as_deref()
        .context("--database-url (DATABASE_URL) is required in server mode")?;
    info!(listen = %opts.listen_address, "potato server starting");

    // ── Release store ────────────────────────────────────────────
    let migrations = (!opts.skip_migration).then_some(opts.migrations_path.as_path());
    let store = prepare_store(database_url, migrations, &ReadinessGate::default())
        .await
        .context("release store is not usable")?;

    // ── Listener ─────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&opts.listen_address)
        .await
        .with_context(|| format!("failed to bind {}", opts.listen_address))?;

    let collector = Arc::new(MetricsCollector::new());
    let plan_server = PlanServer::new(Arc::new(store), collector.clone());

    RunGroup::new()
        .add("server", move |stop| serve(listener, plan_server, collector, stop))
        .add("signal", crate::until_interrupted)
        .run()
        .await?;

    info!("potato server stopped");
    Ok(())
}
