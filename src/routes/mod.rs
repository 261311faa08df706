use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::app_state::AppState;

pub mod health;
pub mod tasks;

/// Body limit sized for bulk uploads of several full-size images.
const BODY_LIMIT: usize = 64 * 1024 * 1024;

/// The task API surface. Shared between `main` and the test harness.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tasks/upload", post(tasks::upload))
        .route("/tasks/bulk-upload", post(tasks::bulk_upload))
        .route("/tasks/finalize", post(tasks::finalize))
        .route("/tasks/:id", get(tasks::get_task))
        .route("/tasks/:id/approve", patch(tasks::approve))
        .route("/health", get(health::health_check))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .with_state(state)
}

/// GET /metrics — scrape endpoint for the `alt_*` counter, gauge, and
/// histogram families registered at process start (task throughput, queue
/// depth, inference latency, worker replicas).
pub async fn prometheus_metrics(
    axum::extract::State(handle): axum::extract::State<Arc<PrometheusHandle>>,
) -> impl IntoResponse {
    handle.render()
}
