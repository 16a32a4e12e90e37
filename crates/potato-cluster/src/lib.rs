//! potato-cluster — the agent and server halves of Potato.
//!
//! Provides the gRPC plan service, the reconciliation agent that drives a
//! local container orchestrator toward the plan, the single-port protocol
//! multiplexer, and the fail-together task group both processes run under.
//!
//! # Architecture
//!
//! ```text
//! Server
//!   └── serve() ── RunGroup (fail-together)
//!       ├── Multiplexer accept loop (peeks first bytes)
//!       │   ├── HTTP/2 preface → gRPC
//!       │   └── HTTP/1.x       → /metrics
//!       ├── tonic server  → PlanServer::get_status() → ReleaseStore
//!       └── axum server   → MetricsCollector::render()
//!
//! Agent
//!   └── Reconciler::run() every tick
//!       ├── PlanSource::fetch_plan()    (gRPC)
//!       ├── Orchestrator::list()        (Docker Swarm)
//!       ├── remove workloads not in the plan
//!       └── create plan services not running
//! ```

pub mod agent;
pub mod docker;
pub mod group;
pub mod mux;
pub mod orchestrator;
pub mod server;

/// Generated protobuf types and gRPC service stubs.
pub mod proto {
    tonic::include_proto!("potato.v1");
}

pub use agent::{GrpcPlanSource, PlanSource, Reconciler, TickError, TickReport};
pub use docker::DockerSwarm;
pub use group::RunGroup;
pub use mux::Multiplexer;
pub use orchestrator::{Orchestrator, OrchestratorError, PortConfig, Workload, WorkloadSpec};
pub use server::{PlanServer, serve, wait_for};
