mod admin;
mod ip_gate;
mod native;
mod openai;

use std::convert::Infallible;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use oguard_core::{EngineBody, EngineResponse, GuardEngine};

pub use ip_gate::{AllowlistError, IpAllowlist};

/// Assemble the full ingress surface: native API, OpenAI API, admin, wrapped
/// in the request log and the IP gate.
pub fn guard_router(engine: GuardEngine) -> Result<Router, AllowlistError> {
    let allowlist = IpAllowlist::parse(&engine.state().config.ip_allowlist)?;

    let router = Router::new()
        .merge(native::router())
        .merge(openai::router())
        .merge(admin::router())
        .layer(middleware::from_fn_with_state(allowlist, ip_gate::ip_gate))
        .layer(middleware::from_fn(request_log))
        .with_state(engine);
    Ok(router)
}

async fn request_log(req: Request<Body>, next: Next) -> Response {
    let trace_id = uuid::Uuid::now_v7();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let resp = next.run(req).await;

    info!(
        %trace_id,
        %method,
        path = %path,
        status = resp.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request"
    );
    resp
}

/// Convert the engine's wire-level response into an axum response; streaming
/// bodies drain the guard pipeline's channel.
pub(crate) fn into_axum(resp: EngineResponse) -> Response {
    let mut builder = Response::builder()
        .status(resp.status)
        .header(header::CONTENT_TYPE, resp.content_type);
    if let Some(retry_after) = resp.retry_after {
        builder = builder.header(header::RETRY_AFTER, retry_after.to_string());
    }
    let body = match resp.body {
        EngineBody::Full(bytes) => Body::from(bytes),
        EngineBody::Stream(rx) => {
            Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>))
        }
    };
    match builder.body(body) {
        Ok(resp) => resp,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}
