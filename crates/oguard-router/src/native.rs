use axum::Router;
use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::Method;
use axum::response::Response;
use axum::routing::{delete, get, post};

use oguard_core::GuardEngine;
use oguard_core::upstream_client::HttpMethod;

use crate::into_axum;

/// Native (upstream-compatible) dialect: guarded generation endpoints plus
/// unguarded model-management passthrough.
pub fn router() -> Router<GuardEngine> {
    Router::new()
        .route("/api/generate", post(generate))
        .route("/api/chat", post(chat))
        .route("/api/embed", post(embed))
        // Model management is forwarded untouched: no scanning, no admission.
        .route("/api/pull", post(passthrough))
        .route("/api/push", post(passthrough))
        .route("/api/create", post(passthrough))
        .route("/api/copy", post(passthrough))
        .route("/api/show", post(passthrough))
        .route("/api/delete", delete(passthrough))
        .route("/api/tags", get(passthrough))
        .route("/api/ps", get(passthrough))
        .route("/api/version", get(passthrough))
}

async fn generate(State(engine): State<GuardEngine>, body: Bytes) -> Response {
    into_axum(engine.generate(body).await)
}

async fn chat(State(engine): State<GuardEngine>, body: Bytes) -> Response {
    into_axum(engine.chat(body).await)
}

async fn embed(State(engine): State<GuardEngine>, body: Bytes) -> Response {
    into_axum(engine.embed(body).await)
}

async fn passthrough(
    State(engine): State<GuardEngine>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    body: Bytes,
) -> Response {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let method = match method {
        Method::GET => HttpMethod::Get,
        Method::DELETE => HttpMethod::Delete,
        _ => HttpMethod::Post,
    };
    let body = if body.is_empty() { None } else { Some(body) };
    into_axum(engine.passthrough(method, &path_and_query, body).await)
}
