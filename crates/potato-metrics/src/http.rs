//! `/metrics` HTTP route.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;

use crate::collector::MetricsCollector;

/// Router exposing the collector at `GET /metrics`.
pub fn metrics_router(collector: Arc<MetricsCollector>) -> Router {
    Router::new()
        .route("/metrics", get(prometheus_metrics))
        .with_state(collector)
}

async fn prometheus_metrics(State(collector): State<Arc<MetricsCollector>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        collector.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::sink::{MetricsSink, ServiceSample};

    #[tokio::test]
    async fn metrics_endpoint_serves_exposition() {
        let collector = Arc::new(MetricsCollector::new());
        collector.services_observed(
            "node-1",
            &[ServiceSample {
                node_id: "node-1".to_string(),
                image: "web:v1".to_string(),
                replicas: 1,
                created_at: Utc::now(),
            }],
        );

        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = metrics_router(collector).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.contains("text/plain"));

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("service_name=\"web\""));
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let collector = Arc::new(MetricsCollector::new());
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let resp = metrics_router(collector).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
