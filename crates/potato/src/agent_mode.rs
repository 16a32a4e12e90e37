//! Agent mode — runs on every node.
//!
//! 1. Makes sure the local Docker engine is a swarm manager
//! 2. Reconciles the swarm against the node's plan every sync interval
//! 3. Serves the agent's own `/metrics` on the advertise address

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use potato_cluster::agent::DEFAULT_CALL_TIMEOUT;
use potato_cluster::{DockerSwarm, GrpcPlanSource, Reconciler, RunGroup, wait_for};
use potato_metrics::{MetricsCollector, metrics_router};

use crate::Opts;

/// Run the agent until interrupted or a component fails.
pub async fn run_agent(opts: &Opts) -> anyhow::Result<()> {
    let node_id = opts.node_id()?;
    info!(%node_id, server = %opts.listen_address, "potato agent starting");

    // ── Orchestrator ─────────────────────────────────────────────
    let docker = DockerSwarm::new(&opts.docker_socket);
    docker
        .ensure_swarm(&opts.swarm_listen_address)
        .await
        .context("failed to join or initialise a swarm")?;

    // ── Plan client ──────────────────────────────────────────────
    let plans = GrpcPlanSource::connect_lazy(&opts.listen_address, DEFAULT_CALL_TIMEOUT)
        .with_context(|| format!("invalid plan server address {}", opts.listen_address))?;

    let collector = Arc::new(MetricsCollector::new());
    let reconciler = Reconciler::new(
        node_id,
        Arc::new(plans),
        Arc::new(docker),
        collector.clone(),
    );

    // ── Metrics endpoint ─────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&opts.advertise_address)
        .await
        .with_context(|| format!("failed to bind metrics address {}", opts.advertise_address))?;
    info!(addr = %opts.advertise_address, "agent metrics listening");
    let router = metrics_router(collector);

    let interval = Duration::from_secs(opts.sync_interval_secs.max(1));

    RunGroup::new()
        .add("reconciler", move |stop| async move {
            reconciler.run(interval, stop).await;
            Ok(())
        })
        .add("metrics-http", move |stop| async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(wait_for(stop))
                .await
                .context("metrics server error")
        })
        .add("signal", crate::until_interrupted)
        .run()
        .await?;

    info!("potato agent stopped");
    Ok(())
}
