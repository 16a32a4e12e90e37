//! Plan server — answers `GetStatus` from the release store.
//!
//! [`serve`] runs the gRPC service and the `/metrics` endpoint on one TCP
//! listener behind the [`Multiplexer`](crate::mux::Multiplexer).

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Code, Request, Response, Status};
use tracing::{Instrument, debug, info, info_span, warn};

use potato_metrics::{MetricsCollector, MetricsSink, metrics_router};
use potato_state::{Plan, ReleaseStore, StoreError};

use crate::group::RunGroup;
use crate::mux::Multiplexer;
use crate::proto;
use crate::proto::potato_server::{Potato, PotatoServer};

/// gRPC implementation of the `Potato` service.
#[derive(Clone)]
pub struct PlanServer {
    store: Arc<dyn ReleaseStore>,
    metrics: Arc<dyn MetricsSink>,
}

impl PlanServer {
    pub fn new(store: Arc<dyn ReleaseStore>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { store, metrics }
    }

    /// Build the plan for `node_id`. Store errors map to `UNAVAILABLE` when
    /// transient and `INTERNAL` otherwise.
    pub async fn plan_for(&self, node_id: &str) -> Result<proto::Plan, Status> {
        let releases = self
            .store
            .releases_for_host(node_id)
            .await
            .map_err(|e| store_status(&e))?;
        let plan = Plan::from_releases(node_id, &releases);
        debug!(%node_id, services = plan.services.len(), "built plan");
        Ok(plan.into())
    }

    pub fn into_service(self) -> PotatoServer<Self> {
        PotatoServer::new(self)
    }
}

#[tonic::async_trait]
impl Potato for PlanServer {
    async fn get_status(
        &self,
        request: Request<proto::StatusRequest>,
    ) -> Result<Response<proto::Plan>, Status> {
        let node_id = request.into_inner().id;
        let span = info_span!("get_status", %node_id);

        let result = self.plan_for(&node_id).instrument(span).await;
        let code = match &result {
            Ok(_) => Code::Ok,
            Err(status) => {
                warn!(%node_id, code = ?status.code(), message = status.message(), "plan request failed");
                status.code()
            }
        };
        self.metrics.plan_request(&node_id, &format!("{code:?}"));
        result.map(Response::new)
    }
}

fn store_status(err: &StoreError) -> Status {
    if err.kind().is_transient() {
        Status::unavailable(format!("release store unavailable: {err}"))
    } else {
        Status::internal(format!("release store error: {err}"))
    }
}

impl From<Plan> for proto::Plan {
    fn from(plan: Plan) -> Self {
        Self {
            id: plan.node_id,
            services: plan
                .services
                .into_iter()
                .map(|s| proto::Service {
                    image: s.image,
                    replicas: s.replicas,
                    ports: s.ports,
                })
                .collect(),
        }
    }
}

impl From<proto::Plan> for Plan {
    fn from(plan: proto::Plan) -> Self {
        Self {
            node_id: plan.id,
            services: plan
                .services
                .into_iter()
                .map(|s| potato_state::Service {
                    image: s.image,
                    replicas: s.replicas,
                    ports: s.ports,
                })
                .collect(),
        }
    }
}

/// Serve gRPC and `/metrics` on `listener` until `shutdown` flips or any
/// part fails.
pub async fn serve(
    listener: TcpListener,
    plan_server: PlanServer,
    collector: Arc<MetricsCollector>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let (mux, grpc_rx, http_listener) =
        Multiplexer::new(listener).context("failed to set up multiplexer")?;
    let addr = mux.local_addr().context("failed to read listener address")?;
    info!(%addr, "plan server listening");

    let router = metrics_router(collector);

    RunGroup::new()
        .add("multiplexer", move |stop| mux.run(stop))
        .add("grpc", move |stop| async move {
            let incoming = ReceiverStream::new(grpc_rx).map(Ok::<_, std::io::Error>);
            tonic::transport::Server::builder()
                .trace_fn(|req| info_span!("grpc", path = %req.uri().path()))
                .add_service(plan_server.into_service())
                .serve_with_incoming_shutdown(incoming, wait_for(stop))
                .await
                .context("gRPC server error")
        })
        .add("metrics-http", move |stop| async move {
            axum::serve(http_listener, router)
                .with_graceful_shutdown(wait_for(stop))
                .await
                .context("metrics server error")
        })
        .add("shutdown", move |stop| async move {
            tokio::select! {
                _ = wait_for(shutdown) => info!("shutdown signal received"),
                _ = wait_for(stop) => {}
            }
            Ok(())
        })
        .run()
        .await
}

/// Resolve once the watch value is `true` or its sender is gone.
pub async fn wait_for(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
