use std::sync::{Arc, Mutex};

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};

use forgejobs_infra::WorkerStats;
use forgejobs_infra::worker::snapshot;
use forgejobs_observability::{InMemoryMetrics, MetricsSnapshot};

/// What the process is running, for the operational endpoints.
#[derive(Clone)]
pub struct AppState {
    pub enabled: bool,
    pub store_backend: &'static str,
    pub transport: &'static str,
    pub metrics: Arc<InMemoryMetrics>,
    /// `None` when the engine is disabled and no workers run.
    pub worker_stats: Option<Arc<Mutex<WorkerStats>>>,
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    engine: JsonValue,
    workers: Option<WorkerStats>,
    metrics: MetricsSnapshot,
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn healthz() -> Json<JsonValue> {
    Json(json!({ "status": "ok" }))
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        engine: json!({
            "enabled": state.enabled,
            "store": state.store_backend,
            "transport": state.transport,
        }),
        workers: state.worker_stats.as_deref().map(snapshot),
        metrics: state.metrics.snapshot(),
    })
}
