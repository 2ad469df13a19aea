//! Metrics HTTP server for the ingest daemon
//!
//! Exposes the pipeline snapshot via an HTTP endpoint for monitoring tools.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;

use crate::metrics::{PipelineMetrics, SharedMetrics};

/// Errors that can occur when running the metrics server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid listen address {0:?}")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /metrics endpoint
/// Returns the current PipelineMetrics as JSON
async fn get_metrics(State(metrics): State<SharedMetrics>) -> Json<PipelineMetrics> {
    let snapshot = metrics.read().await.clone();
    Json(snapshot)
}

/// Creates the axum Router with metrics endpoint
pub fn create_metrics_router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .with_state(metrics)
}

/// Runs the metrics HTTP server
///
/// # Arguments
/// * `metrics` - Shared metrics state to serve
/// * `listen` - Socket address to bind, e.g. `127.0.0.1:7979`
///
/// # Returns
/// * `Ok(())` if server shuts down gracefully
/// * `Err(ServerError)` if server fails to start
pub async fn run_metrics_server(metrics: SharedMetrics, listen: &str) -> Result<(), ServerError> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|_| ServerError::InvalidAddress(listen.to_string()))?;
    let app = create_metrics_router(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Metrics server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::new_shared_metrics;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_get_metrics_returns_json() {
        let metrics = new_shared_metrics();
        {
            let mut snapshot = metrics.write().await;
            snapshot.timestamp_unix_ms = 1701388800000;
            snapshot.lane_started("long", "job-001", "movies/Film (2001)");
            snapshot.set_stage("job-001", "converting");
            snapshot.completed_jobs = 42;
            snapshot.failed_jobs = 2;
            snapshot.published_files = 97;
            snapshot.retried_invocations = 3;
        }

        let app = create_metrics_router(metrics.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let content_type = response
            .headers()
            .get("content-type")
            .expect("should have content-type header");
        assert!(content_type
            .to_str()
            .unwrap()
            .contains("application/json"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let snapshot: PipelineMetrics =
            serde_json::from_slice(&body).expect("should deserialize to PipelineMetrics");

        assert_eq!(snapshot.timestamp_unix_ms, 1701388800000);
        assert_eq!(snapshot.completed_jobs, 42);
        assert_eq!(snapshot.failed_jobs, 2);
        assert_eq!(snapshot.published_files, 97);
        assert_eq!(snapshot.retried_invocations, 3);
        assert_eq!(snapshot.lanes.len(), 1);
        assert_eq!(snapshot.lanes[0].lane, "long");
        assert_eq!(snapshot.lanes[0].stage, "converting");
    }

    #[tokio::test]
    async fn test_get_metrics_empty_snapshot() {
        let metrics = new_shared_metrics();
        let app = create_metrics_router(metrics);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json_str = String::from_utf8(body.to_vec()).unwrap();

        for field in [
            "timestamp_unix_ms",
            "lanes",
            "completed_jobs",
            "failed_jobs",
            "published_files",
            "retried_invocations",
        ] {
            assert!(json_str.contains(field), "missing field {}", field);
        }
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let app = create_metrics_router(new_shared_metrics());
        let response = app
            .oneshot(Request::builder().uri("/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_listen_address() {
        let result = run_metrics_server(new_shared_metrics(), "not an address").await;
        assert!(matches!(result, Err(ServerError::InvalidAddress(_))));
    }
}
