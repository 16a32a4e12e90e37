//! Plan service integration tests.
//!
//! Runs the real server (multiplexer, tonic, axum) on a loopback listener
//! backed by the in-memory release store, then talks to it with the agent's
//! gRPC client and a raw HTTP/1.1 request.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use potato_cluster::{
    GrpcPlanSource, Orchestrator, OrchestratorError, PlanServer, PlanSource, Reconciler,
    Workload, WorkloadSpec, serve,
};
use potato_metrics::{MetricsCollector, NoopSink};
use potato_state::{MemoryReleaseStore, Release};

fn release(host: &str, image: &str, ports: &str, minute: u32) -> Release {
    Release {
        hostname: host.to_string(),
        version: image.to_string(),
        ports: ports.to_string(),
        replicas: 1,
        created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap(),
    }
}

struct Running {
    addr: std::net::SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

async fn start_server(store: MemoryReleaseStore) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let collector = Arc::new(MetricsCollector::new());
    let plan_server = PlanServer::new(Arc::new(store), collector.clone());
    let (shutdown, rx) = watch::channel(false);
    let handle = tokio::spawn(serve(listener, plan_server, collector, rx));
    Running {
        addr,
        shutdown,
        handle,
    }
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).to_string()
}

#[tokio::test]
async fn grpc_and_metrics_share_one_port() {
    let store = MemoryReleaseStore::with_releases(vec![
        release("node-1", "web:v1", "8080", 1),
        release("node-1", "cache:v2", "6379;", 2),
        release("node-2", "other:v1", "", 3),
    ]);
    let server = start_server(store).await;

    let client = GrpcPlanSource::connect_lazy(&server.addr.to_string(), Duration::from_secs(5)).unwrap();
    let plan = client.fetch_plan("node-1").await.unwrap();

    assert_eq!(plan.node_id, "node-1");
    let images: Vec<_> = plan.services.iter().map(|s| s.image.as_str()).collect();
    assert_eq!(images, vec!["cache:v2", "web:v1"]);
    assert_eq!(plan.services[0].ports, vec!["6379".to_string()]);

    let response = http_get(server.addr, "/metrics").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("text/plain; version=0.0.4"), "{response}");
    assert!(
        response.contains(r#"potato_plan_requests_total{node_id="node-1",code="Ok"} 1"#),
        "{response}"
    );

    server.shutdown.send(true).unwrap();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_node_gets_empty_plan() {
    let server = start_server(MemoryReleaseStore::new()).await;

    let client = GrpcPlanSource::connect_lazy(&server.addr.to_string(), Duration::from_secs(5)).unwrap();
    let plan = client.fetch_plan("ghost").await.unwrap();
    assert!(plan.services.is_empty());

    server.shutdown.send(true).unwrap();
    server.handle.await.unwrap().unwrap();
}

#[derive(Default)]
struct RecordingOrchestrator {
    created: Mutex<Vec<WorkloadSpec>>,
}

#[async_trait]
impl Orchestrator for RecordingOrchestrator {
    async fn list(&self) -> Result<Vec<Workload>, OrchestratorError> {
        Ok(Vec::new())
    }

    async fn create(&self, spec: &WorkloadSpec) -> Result<String, OrchestratorError> {
        self.created.lock().unwrap().push(spec.clone());
        Ok("svc-1".to_string())
    }

    async fn remove(&self, _id: &str) -> Result<(), OrchestratorError> {
        Ok(())
    }
}

#[tokio::test]
async fn agent_converges_from_served_plan() {
    let server = start_server(MemoryReleaseStore::with_releases(vec![release(
        "node-1", "web:v1", "9000:80", 1,
    )]))
    .await;

    let source = GrpcPlanSource::connect_lazy(&server.addr.to_string(), Duration::from_secs(5)).unwrap();
    let orchestrator = Arc::new(RecordingOrchestrator::default());
    let reconciler = Reconciler::new(
        "node-1",
        Arc::new(source),
        orchestrator.clone(),
        Arc::new(NoopSink),
    );

    let report = reconciler.reconcile().await.unwrap();
    assert_eq!(report.created, vec!["web:v1".to_string()]);

    let created = orchestrator.created.lock().unwrap().clone();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].ports[0].target_port, 9000);
    assert_eq!(created[0].ports[0].published_port, 80);

    server.shutdown.send(true).unwrap();
    server.handle.await.unwrap().unwrap();
}
