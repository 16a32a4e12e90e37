//! Reconciliation agent.
//!
//! Every tick the agent fetches the node's plan, lists what the local
//! orchestrator is running, removes workloads whose image is no longer
//! planned and creates planned services whose image is not running.
//! Services already running with the planned image are left alone, even if
//! their replica count or ports changed.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, error, info};

use potato_metrics::{MetricsSink, ServiceSample};
use potato_state::{Plan, Service};

use crate::orchestrator::{Orchestrator, OrchestratorError, WorkloadSpec};
use crate::proto;
use crate::proto::potato_client::PotatoClient;

/// Bound on every orchestrator call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Where the agent gets its plan from.
#[async_trait]
pub trait PlanSource: Send + Sync {
    async fn fetch_plan(&self, node_id: &str) -> Result<Plan, tonic::Status>;
}

/// Plan source backed by the plan server's gRPC API.
#[derive(Debug, Clone)]
pub struct GrpcPlanSource {
    client: PotatoClient<Channel>,
}

impl GrpcPlanSource {
    /// Client for the server at `addr` (`host:port` or a full URI). The
    /// connection is made on first use; each request is bounded by
    /// `timeout`.
    pub fn connect_lazy(addr: &str, timeout: Duration) -> Result<Self, tonic::transport::Error> {
        let uri = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        };
        let channel = Endpoint::from_shared(uri)?
            .timeout(timeout)
            .connect_timeout(timeout)
            .connect_lazy();
        Ok(Self {
            client: PotatoClient::new(channel),
        })
    }
}

#[async_trait]
impl PlanSource for GrpcPlanSource {
    async fn fetch_plan(&self, node_id: &str) -> Result<Plan, tonic::Status> {
        let mut client = self.client.clone();
        let response = client
            .get_status(proto::StatusRequest {
                id: node_id.to_string(),
            })
            .await?;
        Ok(response.into_inner().into())
    }
}

/// Why a tick was skipped.
#[derive(Debug, Error)]
pub enum TickError {
    #[error("failed to fetch plan: {0}")]
    Plan(tonic::Status),

    #[error("failed to list workloads: {0}")]
    List(OrchestratorError),
}

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Images of removed workloads.
    pub removed: Vec<String>,
    /// Images of created services.
    pub created: Vec<String>,
    /// Remove or create calls that failed.
    pub failures: usize,
}

impl TickReport {
    pub fn is_noop(&self) -> bool {
        self.removed.is_empty() && self.created.is_empty() && self.failures == 0
    }
}

/// Drives the local orchestrator toward the node's plan.
pub struct Reconciler {
    node_id: String,
    plan: Arc<dyn PlanSource>,
    orchestrator: Arc<dyn Orchestrator>,
    metrics: Arc<dyn MetricsSink>,
    call_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        node_id: impl Into<String>,
        plan: Arc<dyn PlanSource>,
        orchestrator: Arc<dyn Orchestrator>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            plan,
            orchestrator,
            metrics,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Run one reconciliation pass.
    ///
    /// A failed plan fetch or workload listing skips the pass. Individual
    /// remove and create failures are logged, counted and do not stop the
    /// remaining calls.
    pub async fn reconcile(&self) -> Result<TickReport, TickError> {
        let plan = self
            .plan
            .fetch_plan(&self.node_id)
            .await
            .map_err(TickError::Plan)?;
        let expected: HashSet<&str> = plan.services.iter().map(|s| s.image.as_str()).collect();

        let workloads = self
            .bounded(self.orchestrator.list())
            .await
            .map_err(TickError::List)?;
        let running: HashSet<&str> = workloads.iter().map(|w| w.image.as_str()).collect();

        let samples: Vec<ServiceSample> = workloads
            .iter()
            .map(|w| ServiceSample {
                node_id: self.node_id.clone(),
                image: w.image.clone(),
                replicas: w.replicas,
                created_at: w.created_at,
            })
            .collect();
        self.metrics.services_observed(&self.node_id, &samples);

        let mut report = TickReport::default();

        for workload in workloads
            .iter()
            .filter(|w| !expected.contains(w.image.as_str()))
        {
            match self.bounded(self.orchestrator.remove(&workload.id)).await {
                Ok(()) => {
                    info!(id = %workload.id, image = %workload.image, "removed workload");
                    report.removed.push(workload.image.clone());
                }
                Err(e) => {
                    error!(id = %workload.id, image = %workload.image, error = %e, "failed to remove workload");
                    report.failures += 1;
                }
            }
        }

        let mut requested = HashSet::new();
        for service in &plan.services {
            if running.contains(service.image.as_str()) || !requested.insert(service.image.as_str())
            {
                continue;
            }
            match self.create(service).await {
                Ok(id) => {
                    info!(%id, image = %service.image, replicas = service.replicas, "created workload");
                    report.created.push(service.image.clone());
                }
                Err(e) => {
                    error!(image = %service.image, error = %e, "failed to create workload");
                    report.failures += 1;
                }
            }
        }

        Ok(report)
    }

    async fn create(&self, service: &Service) -> Result<String, OrchestratorError> {
        let spec = WorkloadSpec::from_service(service)?;
        self.bounded(self.orchestrator.create(&spec)).await
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, OrchestratorError>>,
    ) -> Result<T, OrchestratorError> {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .unwrap_or(Err(OrchestratorError::Timeout(self.call_timeout)))
    }

    /// Reconcile every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(node_id = %self.node_id, ?interval, "reconciliation loop starting");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => match self.reconcile().await {
                    Ok(report) if report.is_noop() => debug!("node converged"),
                    Ok(report) => info!(
                        removed = ?report.removed,
                        created = ?report.created,
                        failures = report.failures,
                        "reconciled node"
                    ),
                    Err(e) => error!(node_id = %self.node_id, error = %e, "reconciliation skipped"),
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("reconciliation loop stopped");
    }
}
