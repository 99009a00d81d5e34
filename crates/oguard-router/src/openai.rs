use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::response::Response;
use axum::routing::{get, post};

use oguard_core::GuardEngine;

use crate::into_axum;

/// OpenAI-compatible dialect, translated onto the native upstream.
pub fn router() -> Router<GuardEngine> {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/models", get(models))
}

async fn chat_completions(State(engine): State<GuardEngine>, body: Bytes) -> Response {
    into_axum(engine.openai_chat_completions(body).await)
}

async fn completions(State(engine): State<GuardEngine>, body: Bytes) -> Response {
    into_axum(engine.openai_completions(body).await)
}

async fn embeddings(State(engine): State<GuardEngine>, body: Bytes) -> Response {
    into_axum(engine.openai_embeddings(body).await)
}

async fn models(State(engine): State<GuardEngine>) -> Response {
    into_axum(engine.openai_models().await)
}
