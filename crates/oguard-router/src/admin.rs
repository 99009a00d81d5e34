use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;

use oguard_core::GuardEngine;
use oguard_core::state;

/// Liveness, stats, config introspection, and the cache/queue maintenance
/// surface.
pub fn router() -> Router<GuardEngine> {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/config", get(config))
        .route("/admin/cache/clear", post(cache_clear))
        .route("/admin/cache/cleanup", post(cache_cleanup))
        .route("/queue/stats", get(queue_stats))
        .route("/queue/memory", get(queue_memory))
        .route("/admin/queue/reset", post(queue_reset))
        .route("/admin/queue/update", post(queue_update))
        .route("/admin/scanners/update", post(scanners_update))
}

async fn health(State(engine): State<GuardEngine>) -> Response {
    Json(json!({
        "status": "ok",
        "uptime": engine.state().uptime_secs(),
        "version": state::VERSION,
    }))
    .into_response()
}

async fn stats(State(engine): State<GuardEngine>) -> Response {
    let app = engine.state();
    let queues = app.admission.snapshots();
    let total_processed: u64 = queues.iter().map(|q| q.total_processed).sum();
    let total_rejected: u64 = queues.iter().map(|q| q.total_rejected).sum();
    Json(json!({
        "cache": app.cache.snapshot(),
        "admission": {
            "models": queues,
            "total_processed": total_processed,
            "total_rejected": total_rejected,
        },
        "uptime": app.uptime_secs(),
    }))
    .into_response()
}

async fn config(State(engine): State<GuardEngine>) -> Response {
    Json(engine.state().public_config()).into_response()
}

async fn cache_clear(State(engine): State<GuardEngine>) -> Response {
    let cleared = engine.state().cache.clear().await;
    Json(json!({ "cleared": cleared })).into_response()
}

async fn cache_cleanup(State(engine): State<GuardEngine>) -> Response {
    let removed = engine.state().cache.cleanup();
    Json(json!({ "removed": removed })).into_response()
}

async fn queue_stats(State(engine): State<GuardEngine>) -> Response {
    Json(json!({ "models": engine.state().admission.snapshots() })).into_response()
}

async fn queue_memory(State(engine): State<GuardEngine>) -> Response {
    Json(engine.state().admission.memory()).into_response()
}

async fn queue_reset(State(engine): State<GuardEngine>) -> Response {
    let removed = engine.state().admission.reset();
    Json(json!({ "removed_queues": removed })).into_response()
}

#[derive(Debug, Deserialize)]
struct QueueUpdateBody {
    model: String,
    parallel_limit: Option<u32>,
    queue_limit: Option<u32>,
}

async fn queue_update(
    State(engine): State<GuardEngine>,
    Json(body): Json<QueueUpdateBody>,
) -> Response {
    if body.model.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing required field: model" })),
        )
            .into_response();
    }
    engine
        .state()
        .admission
        .update(&body.model, body.parallel_limit, body.queue_limit);
    let snapshot = engine
        .state()
        .admission
        .snapshots()
        .into_iter()
        .find(|q| q.model == body.model);
    Json(json!({ "updated": snapshot })).into_response()
}

#[derive(Debug, Deserialize)]
struct ScannerUpdateBody {
    side: String,
    scanner: String,
    enabled: bool,
}

async fn scanners_update(
    State(engine): State<GuardEngine>,
    Json(body): Json<ScannerUpdateBody>,
) -> Response {
    let app = engine.state();
    let pipeline = match body.side.as_str() {
        "input" => &app.input_pipeline,
        "output" => &app.output_pipeline,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "side must be \"input\" or \"output\"" })),
            )
                .into_response();
        }
    };
    if !pipeline.set_enabled(&body.scanner, body.enabled) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown scanner {:?}", body.scanner) })),
        )
            .into_response();
    }
    Json(json!({ "side": body.side, "scanners": pipeline.scanners() })).into_response()
}
