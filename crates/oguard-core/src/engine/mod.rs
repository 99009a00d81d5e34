pub mod stream_guard;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};

use oguard_protocol::ollama::chat::{ChatRequest, ChatResponse};
use oguard_protocol::ollama::embed::{EmbedRequest, EmbedResponse};
use oguard_protocol::ollama::generate::{GenerateRequest, GenerateResponse};
use oguard_protocol::ollama::manage::TagsResponse;
use oguard_protocol::openai::chat_completions::ChatCompletionRequest;
use oguard_protocol::openai::completions::CompletionRequest;
use oguard_protocol::openai::embeddings::EmbeddingsRequest;
use oguard_scan::{Fingerprint, Side};
use oguard_transform::stream::{ChatStreamState, CompletionStreamState};
use oguard_transform::{extract, request as translate_request, response as translate_response};

use crate::error::{ErrorDialect, GuardError, failed_scanners};
use crate::state::AppState;
use crate::upstream_client::{
    HttpMethod, StreamingBody, UpstreamBody, UpstreamFailure, UpstreamHttpRequest,
    UpstreamTransportErrorKind,
};

use stream_guard::{GenKind, GuardParams, StreamShape, spawn_guarded_stream};

const NDJSON: &str = "application/x-ndjson";
const SSE: &str = "text/event-stream";
const JSON: &str = "application/json";

pub enum EngineBody {
    Full(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

/// Wire-level response the router turns into an axum response verbatim.
pub struct EngineResponse {
    pub status: u16,
    pub content_type: String,
    pub retry_after: Option<u64>,
    pub body: EngineBody,
}

impl EngineResponse {
    fn full(status: u16, content_type: &str, body: Bytes) -> Self {
        Self {
            status,
            content_type: content_type.to_string(),
            retry_after: None,
            body: EngineBody::Full(body),
        }
    }

    fn json_ok(body: Bytes) -> Self {
        Self::full(200, JSON, body)
    }

    fn stream(content_type: &str, rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            status: 200,
            content_type: content_type.to_string(),
            retry_after: None,
            body: EngineBody::Stream(rx),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Native,
    OpenAiChat,
    OpenAiCompletion,
}

impl Dialect {
    fn error_dialect(self) -> ErrorDialect {
        match self {
            Dialect::Native => ErrorDialect::Native,
            Dialect::OpenAiChat | Dialect::OpenAiCompletion => ErrorDialect::OpenAi,
        }
    }
}

struct GenerationCall {
    dialect: Dialect,
    kind: GenKind,
    model: String,
    input_text: String,
    upstream_path: &'static str,
    upstream_body: Bytes,
    stream: bool,
}

fn render(err: GuardError, dialect: ErrorDialect) -> EngineResponse {
    EngineResponse {
        status: err.status().as_u16(),
        content_type: JSON.to_string(),
        retry_after: err.retry_after_secs(),
        body: EngineBody::Full(err.body_bytes(dialect)),
    }
}

fn failure_to_error(failure: UpstreamFailure) -> GuardError {
    match failure.kind {
        UpstreamTransportErrorKind::Timeout | UpstreamTransportErrorKind::ReadTimeout => {
            GuardError::UpstreamTimeout {
                message: failure.message,
            }
        }
        _ => GuardError::UpstreamUnavailable {
            message: failure.message,
        },
    }
}

fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

/// The request orchestrator: wires cache, scanner pipelines, admission,
/// upstream client, translator, and the streaming guard together per
/// endpoint.
#[derive(Clone)]
pub struct GuardEngine {
    state: Arc<AppState>,
}

impl GuardEngine {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    // ---- native dialect -------------------------------------------------

    pub async fn generate(&self, body: Bytes) -> EngineResponse {
        let req: GenerateRequest = match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(err) => return self.bad_request(Dialect::Native, err),
        };
        if req.model.is_empty() {
            return self.missing_model(Dialect::Native);
        }
        self.run_generation(GenerationCall {
            dialect: Dialect::Native,
            kind: GenKind::Generate,
            model: req.model.clone(),
            input_text: extract::generate_input_text(&req),
            upstream_path: "/api/generate",
            // Native bodies are forwarded byte-identical, never re-serialized.
            upstream_body: body,
            stream: req.stream.unwrap_or(true),
        })
        .await
    }

    pub async fn chat(&self, body: Bytes) -> EngineResponse {
        let req: ChatRequest = match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(err) => return self.bad_request(Dialect::Native, err),
        };
        if req.model.is_empty() {
            return self.missing_model(Dialect::Native);
        }
        self.run_generation(GenerationCall {
            dialect: Dialect::Native,
            kind: GenKind::Chat,
            model: req.model.clone(),
            input_text: extract::chat_input_text(&req),
            upstream_path: "/api/chat",
            upstream_body: body,
            stream: req.stream.unwrap_or(true),
        })
        .await
    }

    /// Embeddings are input-scanned but bypass admission.
    pub async fn embed(&self, body: Bytes) -> EngineResponse {
        let req: EmbedRequest = match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(err) => return self.bad_request(Dialect::Native, err),
        };
        if req.model.is_empty() {
            return self.missing_model(Dialect::Native);
        }
        if let Some(err) = self.scan_input(&req.input.joined()).await {
            return render(err, ErrorDialect::Native);
        }

        let url = format!("{}/api/embed", self.state.upstream_base());
        match self
            .state
            .upstream
            .send(UpstreamHttpRequest::json_post(url, body, false))
            .await
        {
            Ok(resp) => match resp.body {
                UpstreamBody::Bytes(bytes) => EngineResponse::full(resp.status, JSON, bytes),
                UpstreamBody::Stream(streaming) => {
                    EngineResponse::stream(JSON, pump_passthrough(streaming))
                }
            },
            Err(failure) => render(failure_to_error(failure), ErrorDialect::Native),
        }
    }

    // ---- OpenAI dialect -------------------------------------------------

    pub async fn openai_chat_completions(&self, body: Bytes) -> EngineResponse {
        let req: ChatCompletionRequest = match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(err) => return self.bad_request(Dialect::OpenAiChat, err),
        };
        if req.model.is_empty() {
            return self.missing_model(Dialect::OpenAiChat);
        }
        let input_text = extract::openai_chat_input_text(&req);
        let model = req.model.clone();
        let stream = req.stream.unwrap_or(false);
        let native = translate_request::chat_completion_to_native(req);
        let upstream_body = match serde_json::to_vec(&native) {
            Ok(body) => Bytes::from(body),
            Err(err) => return self.bad_request(Dialect::OpenAiChat, err),
        };
        self.run_generation(GenerationCall {
            dialect: Dialect::OpenAiChat,
            kind: GenKind::Chat,
            model,
            input_text,
            upstream_path: "/api/chat",
            upstream_body,
            stream,
        })
        .await
    }

    pub async fn openai_completions(&self, body: Bytes) -> EngineResponse {
        let req: CompletionRequest = match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(err) => return self.bad_request(Dialect::OpenAiCompletion, err),
        };
        if req.model.is_empty() {
            return self.missing_model(Dialect::OpenAiCompletion);
        }
        let input_text = extract::openai_completion_input_text(&req);
        let model = req.model.clone();
        let stream = req.stream.unwrap_or(false);
        let native = translate_request::completion_to_native(req);
        let upstream_body = match serde_json::to_vec(&native) {
            Ok(body) => Bytes::from(body),
            Err(err) => return self.bad_request(Dialect::OpenAiCompletion, err),
        };
        self.run_generation(GenerationCall {
            dialect: Dialect::OpenAiCompletion,
            kind: GenKind::Generate,
            model,
            input_text,
            upstream_path: "/api/generate",
            upstream_body,
            stream,
        })
        .await
    }

    pub async fn openai_embeddings(&self, body: Bytes) -> EngineResponse {
        let req: EmbeddingsRequest = match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(err) => return self.bad_request(Dialect::OpenAiChat, err),
        };
        if req.model.is_empty() {
            return self.missing_model(Dialect::OpenAiChat);
        }
        if let Some(err) = self.scan_input(&req.input.joined()).await {
            return render(err, ErrorDialect::OpenAi);
        }
        let model = req.model.clone();
        let native = translate_request::embeddings_to_native(req);
        let upstream_body = match serde_json::to_vec(&native) {
            Ok(body) => Bytes::from(body),
            Err(err) => return self.bad_request(Dialect::OpenAiChat, err),
        };

        let url = format!("{}/api/embed", self.state.upstream_base());
        let resp = match self
            .state
            .upstream
            .send(UpstreamHttpRequest::json_post(url, upstream_body, false))
            .await
        {
            Ok(resp) => resp,
            Err(failure) => return render(failure_to_error(failure), ErrorDialect::OpenAi),
        };
        let bytes = match resp.body {
            UpstreamBody::Bytes(bytes) => bytes,
            UpstreamBody::Stream(streaming) => {
                streaming.cancel();
                return render(
                    GuardError::UpstreamUnavailable {
                        message: "unexpected streaming embed response".to_string(),
                    },
                    ErrorDialect::OpenAi,
                );
            }
        };
        if resp.status >= 400 {
            return EngineResponse::full(resp.status, JSON, bytes);
        }
        let native_resp: EmbedResponse = match serde_json::from_slice(&bytes) {
            Ok(resp) => resp,
            Err(_) => {
                return render(
                    GuardError::UpstreamUnavailable {
                        message: "undecodable embed response".to_string(),
                    },
                    ErrorDialect::OpenAi,
                );
            }
        };
        let openai = translate_response::embed_to_openai(model, &native_resp);
        match serde_json::to_vec(&openai) {
            Ok(body) => EngineResponse::json_ok(Bytes::from(body)),
            Err(err) => self.bad_request(Dialect::OpenAiChat, err),
        }
    }

    pub async fn openai_models(&self) -> EngineResponse {
        let url = format!("{}/api/tags", self.state.upstream_base());
        let req = UpstreamHttpRequest {
            method: HttpMethod::Get,
            url,
            headers: Vec::new(),
            body: None,
            want_stream: false,
        };
        let resp = match self.state.upstream.send(req).await {
            Ok(resp) => resp,
            Err(failure) => return render(failure_to_error(failure), ErrorDialect::OpenAi),
        };
        let bytes = match resp.body {
            UpstreamBody::Bytes(bytes) => bytes,
            UpstreamBody::Stream(streaming) => {
                streaming.cancel();
                Bytes::new()
            }
        };
        if resp.status >= 400 {
            return EngineResponse::full(resp.status, JSON, bytes);
        }
        let tags: TagsResponse = match serde_json::from_slice(&bytes) {
            Ok(tags) => tags,
            Err(_) => {
                return render(
                    GuardError::UpstreamUnavailable {
                        message: "undecodable tags response".to_string(),
                    },
                    ErrorDialect::OpenAi,
                );
            }
        };
        let list = translate_response::tags_to_models(&tags);
        match serde_json::to_vec(&list) {
            Ok(body) => EngineResponse::json_ok(Bytes::from(body)),
            Err(err) => self.bad_request(Dialect::OpenAiChat, err),
        }
    }

    // ---- model management passthrough ----------------------------------

    /// Forward a model-management call untouched: no scanning, no admission.
    pub async fn passthrough(
        &self,
        method: HttpMethod,
        path_and_query: &str,
        body: Option<Bytes>,
    ) -> EngineResponse {
        let url = format!("{}{}", self.state.upstream_base(), path_and_query);
        let mut headers = Vec::new();
        if body.is_some() {
            headers.push(("content-type".to_string(), JSON.to_string()));
        }
        let req = UpstreamHttpRequest {
            method,
            url,
            headers,
            body,
            want_stream: true,
        };
        match self.state.upstream.send(req).await {
            Ok(resp) => {
                let content_type =
                    header_value(&resp.headers, "content-type").unwrap_or_else(|| JSON.to_string());
                match resp.body {
                    UpstreamBody::Bytes(bytes) => {
                        EngineResponse::full(resp.status, &content_type, bytes)
                    }
                    UpstreamBody::Stream(streaming) => EngineResponse {
                        status: resp.status,
                        content_type,
                        retry_after: None,
                        body: EngineBody::Stream(pump_passthrough(streaming)),
                    },
                }
            }
            Err(failure) => render(failure_to_error(failure), ErrorDialect::Native),
        }
    }

    // ---- shared flow ----------------------------------------------------

    async fn run_generation(&self, call: GenerationCall) -> EngineResponse {
        if let Some(err) = self.scan_input(&call.input_text).await {
            debug!(model = %call.model, "input blocked");
            return render(err, call.dialect.error_dialect());
        }

        let ticket = match self.state.admission.acquire(&call.model).await {
            Ok(ticket) => ticket,
            Err(crate::admission::Rejection::QueueFull { retry_after_secs }) => {
                info!(model = %call.model, "admission queue full");
                return render(
                    GuardError::QueueFull { retry_after_secs },
                    call.dialect.error_dialect(),
                );
            }
        };

        let url = format!("{}{}", self.state.upstream_base(), call.upstream_path);
        let resp = match self
            .state
            .upstream
            .send(UpstreamHttpRequest::json_post(
                url,
                call.upstream_body.clone(),
                call.stream,
            ))
            .await
        {
            Ok(resp) => resp,
            Err(failure) => {
                drop(ticket);
                return render(failure_to_error(failure), call.dialect.error_dialect());
            }
        };

        if resp.status >= 400 {
            drop(ticket);
            let bytes = match resp.body {
                UpstreamBody::Bytes(bytes) => bytes,
                UpstreamBody::Stream(streaming) => {
                    streaming.cancel();
                    Bytes::new()
                }
            };
            return EngineResponse::full(resp.status, JSON, bytes);
        }

        match resp.body {
            UpstreamBody::Stream(streaming) => {
                let shape = match call.dialect {
                    Dialect::Native => StreamShape::Native,
                    Dialect::OpenAiChat => StreamShape::OpenAiChat(ChatStreamState::new()),
                    Dialect::OpenAiCompletion => {
                        StreamShape::OpenAiCompletion(CompletionStreamState::new())
                    }
                };
                let content_type = match call.dialect {
                    Dialect::Native => NDJSON,
                    _ => SSE,
                };
                let params = GuardParams {
                    cache: Arc::clone(&self.state.cache),
                    pipeline: Arc::clone(&self.state.output_pipeline),
                    output_enabled: self.state.config.scan.output_enabled
                        && !self.state.output_pipeline.is_empty(),
                    window_bytes: self.state.config.scan.window_bytes,
                    prompt: call.input_text,
                    kind: call.kind,
                };
                let rx = spawn_guarded_stream(params, shape, streaming, ticket);
                EngineResponse::stream(content_type, rx)
            }
            UpstreamBody::Bytes(bytes) => {
                // Upstream answered without streaming (or the call was
                // non-streaming to begin with).
                let response = self.finish_non_streaming(&call, bytes).await;
                drop(ticket);
                response
            }
        }
    }

    async fn finish_non_streaming(&self, call: &GenerationCall, bytes: Bytes) -> EngineResponse {
        match call.kind {
            GenKind::Chat => {
                let native: ChatResponse = match serde_json::from_slice(&bytes) {
                    Ok(native) => native,
                    Err(_) => {
                        return render(
                            GuardError::UpstreamUnavailable {
                                message: "undecodable chat response".to_string(),
                            },
                            call.dialect.error_dialect(),
                        );
                    }
                };
                let output = extract::chat_output_delta(&native).to_string();
                if let Some(err) = self.scan_output(&call.input_text, &output).await {
                    return render(err, call.dialect.error_dialect());
                }
                match call.dialect {
                    Dialect::Native => EngineResponse::json_ok(bytes),
                    _ => {
                        let id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
                        let openai = translate_response::chat_to_openai(id, &native);
                        match serde_json::to_vec(&openai) {
                            Ok(body) => EngineResponse::json_ok(Bytes::from(body)),
                            Err(err) => self.bad_request(call.dialect, err),
                        }
                    }
                }
            }
            GenKind::Generate => {
                let native: GenerateResponse = match serde_json::from_slice(&bytes) {
                    Ok(native) => native,
                    Err(_) => {
                        return render(
                            GuardError::UpstreamUnavailable {
                                message: "undecodable generate response".to_string(),
                            },
                            call.dialect.error_dialect(),
                        );
                    }
                };
                let output = extract::generate_output_delta(&native).to_string();
                if let Some(err) = self.scan_output(&call.input_text, &output).await {
                    return render(err, call.dialect.error_dialect());
                }
                match call.dialect {
                    Dialect::Native => EngineResponse::json_ok(bytes),
                    _ => {
                        let id = format!("cmpl-{}", uuid::Uuid::new_v4().simple());
                        let openai = translate_response::generate_to_openai(id, &native);
                        match serde_json::to_vec(&openai) {
                            Ok(body) => EngineResponse::json_ok(Bytes::from(body)),
                            Err(err) => self.bad_request(call.dialect, err),
                        }
                    }
                }
            }
        }
    }

    async fn scan_input(&self, text: &str) -> Option<GuardError> {
        if !self.state.config.scan.input_enabled || self.state.input_pipeline.is_empty() {
            return None;
        }
        let fingerprint = Fingerprint::compute(Side::Input, text);
        let pipeline = Arc::clone(&self.state.input_pipeline);
        let owned = text.to_string();
        let verdict = self
            .state
            .cache
            .scan_or_join(
                fingerprint,
                async move { pipeline.run_detached(None, owned).await },
                true,
            )
            .await;
        if verdict.allowed {
            None
        } else {
            Some(GuardError::InputBlocked {
                failed: failed_scanners(&verdict),
            })
        }
    }

    async fn scan_output(&self, prompt: &str, text: &str) -> Option<GuardError> {
        if !self.state.config.scan.output_enabled || self.state.output_pipeline.is_empty() {
            return None;
        }
        let fingerprint = Fingerprint::compute(Side::Output, text);
        let pipeline = Arc::clone(&self.state.output_pipeline);
        let prompt = prompt.to_string();
        let owned = text.to_string();
        let verdict = self
            .state
            .cache
            .scan_or_join(
                fingerprint,
                async move { pipeline.run_detached(Some(prompt), owned).await },
                true,
            )
            .await;
        if verdict.allowed {
            None
        } else {
            Some(GuardError::OutputBlocked {
                failed: failed_scanners(&verdict),
            })
        }
    }

    fn bad_request(&self, dialect: Dialect, err: impl std::fmt::Display) -> EngineResponse {
        render(
            GuardError::BadRequest {
                message: format!("invalid request body: {err}"),
            },
            dialect.error_dialect(),
        )
    }

    fn missing_model(&self, dialect: Dialect) -> EngineResponse {
        render(
            GuardError::BadRequest {
                message: "missing required field: model".to_string(),
            },
            dialect.error_dialect(),
        )
    }
}

/// Pump an unguarded upstream stream to the client, cancelling upstream when
/// the client goes away.
fn pump_passthrough(mut streaming: StreamingBody) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        while let Some(item) = streaming.recv().await {
            match item {
                Ok(chunk) => {
                    if tx.send(chunk).await.is_err() {
                        streaming.cancel();
                        break;
                    }
                }
                Err(failure) => {
                    debug!(message = %failure.message, "passthrough stream ended with error");
                    break;
                }
            }
        }
    });
    rx
}
