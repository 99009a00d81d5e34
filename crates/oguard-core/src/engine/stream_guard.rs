use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use oguard_protocol::ndjson::{self, NdjsonSplitter};
use oguard_protocol::ollama::StreamErrorChunk;
use oguard_protocol::ollama::chat::ChatResponse;
use oguard_protocol::ollama::generate::GenerateResponse;
use oguard_protocol::openai::OpenAiErrorBody;
use oguard_protocol::sse;
use oguard_protocol::FailedScanner;
use oguard_scan::{Fingerprint, Pipeline, ScanCache, ScanResult, Side};
use oguard_transform::extract;
use oguard_transform::stream::{ChatStreamState, CompletionStreamState};

use crate::admission::AdmissionTicket;
use crate::error::failed_scanners;
use crate::upstream_client::{StreamingBody, UpstreamFailure, UpstreamTransportErrorKind};

/// Which native generation endpoint the stream came from; decides how output
/// text is extracted from each NDJSON chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenKind {
    Generate,
    Chat,
}

/// Client-facing framing for the guarded stream.
pub enum StreamShape {
    /// Pass native NDJSON lines through verbatim.
    Native,
    /// Translate chat chunks into OpenAI SSE frames.
    OpenAiChat(ChatStreamState),
    /// Translate generate chunks into OpenAI SSE frames.
    OpenAiCompletion(CompletionStreamState),
}

pub struct GuardParams {
    pub cache: Arc<ScanCache>,
    pub pipeline: Arc<Pipeline>,
    pub output_enabled: bool,
    pub window_bytes: usize,
    /// Original prompt, handed to output scanners as context.
    pub prompt: String,
    pub kind: GenKind,
}

/// Start the guarded tee. The driver task owns the admission ticket (released
/// when the task ends, on every exit path) and the upstream body (cancelled
/// the moment a violation or client disconnect is seen).
pub fn spawn_guarded_stream(
    params: GuardParams,
    shape: StreamShape,
    upstream: StreamingBody,
    ticket: AdmissionTicket,
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let driver = Driver {
            params,
            shape,
            upstream,
            tx,
            accumulator: String::new(),
            scanned_len: None,
            last_verdict: None,
        };
        driver.run(ticket).await;
    });
    rx
}

enum LineOutcome {
    Continue,
    Blocked,
    ClientGone,
}

enum Exit {
    Eof,
    Blocked,
    ClientGone,
    UpstreamError,
}

struct Driver {
    params: GuardParams,
    shape: StreamShape,
    upstream: StreamingBody,
    tx: mpsc::Sender<Bytes>,
    accumulator: String,
    /// Accumulator length covered by the most recent windowed scan.
    scanned_len: Option<usize>,
    last_verdict: Option<ScanResult>,
}

impl Driver {
    async fn run(mut self, ticket: AdmissionTicket) {
        // Dropping the ticket when this task returns is the single release
        // point for the admission slot.
        let _ticket = ticket;

        let mut splitter = NdjsonSplitter::new();
        let exit = 'recv: loop {
            let Some(item) = self.upstream.recv().await else {
                break Exit::Eof;
            };
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(failure) => {
                    warn!(message = %failure.message, "upstream stream failed mid-generation");
                    self.upstream.cancel();
                    self.emit_upstream_failure(&failure).await;
                    break Exit::UpstreamError;
                }
            };
            for line in splitter.push_bytes(&chunk) {
                match self.handle_line(&line).await {
                    LineOutcome::Continue => {}
                    LineOutcome::Blocked => break 'recv Exit::Blocked,
                    LineOutcome::ClientGone => break 'recv Exit::ClientGone,
                }
            }
        };

        match exit {
            Exit::Eof => {
                if let Some(line) = splitter.finish() {
                    match self.handle_line(&line).await {
                        LineOutcome::Continue => {}
                        LineOutcome::Blocked | LineOutcome::ClientGone => return,
                    }
                }
                self.finish_stream().await;
            }
            Exit::Blocked | Exit::ClientGone | Exit::UpstreamError => {}
        }
    }

    /// One complete NDJSON line from the upstream: extract its text delta,
    /// run the windowed scan when the accumulator has grown enough, and only
    /// then forward the line's frames. The chunk that crosses the threshold
    /// is held until its scan passes, so a violating chunk never reaches the
    /// client.
    async fn handle_line(&mut self, line: &str) -> LineOutcome {
        let frames = self.frames_for_line(line);

        if self.window_crossed() {
            let verdict = self.scan_accumulator(false).await;
            self.scanned_len = Some(self.accumulator.len());
            if !verdict.allowed {
                // Cancel first: the backend must stop computing within this
                // same scheduling step, before we spend time on the client.
                self.upstream.cancel();
                self.emit_violation(failed_scanners(&verdict)).await;
                return LineOutcome::Blocked;
            }
            self.last_verdict = Some(verdict);
        }

        for frame in frames {
            if self.tx.send(frame).await.is_err() {
                debug!("client went away mid-stream, cancelling upstream");
                self.upstream.cancel();
                return LineOutcome::ClientGone;
            }
        }
        LineOutcome::Continue
    }

    fn frames_for_line(&mut self, line: &str) -> Vec<Bytes> {
        let mut frames = Vec::new();
        match &mut self.shape {
            StreamShape::Native => {
                match self.params.kind {
                    GenKind::Chat => {
                        if let Ok(chunk) = serde_json::from_str::<ChatResponse>(line) {
                            self.accumulator.push_str(extract::chat_output_delta(&chunk));
                        }
                    }
                    GenKind::Generate => {
                        if let Ok(chunk) = serde_json::from_str::<GenerateResponse>(line) {
                            self.accumulator
                                .push_str(extract::generate_output_delta(&chunk));
                        }
                    }
                }
                frames.push(ndjson::encode_line(line));
            }
            StreamShape::OpenAiChat(state) => match serde_json::from_str::<ChatResponse>(line) {
                Ok(chunk) => {
                    self.accumulator.push_str(extract::chat_output_delta(&chunk));
                    for frame in state.transform_chunk(&chunk) {
                        if let Ok(json) = serde_json::to_string(&frame) {
                            frames.push(sse::encode_data_frame(&json));
                        }
                    }
                }
                Err(err) => debug!(error = %err, "undecodable chat chunk skipped"),
            },
            StreamShape::OpenAiCompletion(state) => {
                match serde_json::from_str::<GenerateResponse>(line) {
                    Ok(chunk) => {
                        self.accumulator
                            .push_str(extract::generate_output_delta(&chunk));
                        for frame in state.transform_chunk(&chunk) {
                            if let Ok(json) = serde_json::to_string(&frame) {
                                frames.push(sse::encode_data_frame(&json));
                            }
                        }
                    }
                    Err(err) => debug!(error = %err, "undecodable generate chunk skipped"),
                }
            }
        }
        frames
    }

    fn window_crossed(&self) -> bool {
        if !self.params.output_enabled || self.accumulator.is_empty() {
            return false;
        }
        let grown = self.accumulator.len() - self.scanned_len.unwrap_or(0);
        grown >= self.params.window_bytes
    }

    /// Scan the full accumulator (never a delta) through the cache with
    /// single-flight. Windowed scans are transient: partial output must not
    /// populate the cache.
    async fn scan_accumulator(&self, store: bool) -> ScanResult {
        let fingerprint = Fingerprint::compute(Side::Output, &self.accumulator);
        let pipeline = Arc::clone(&self.params.pipeline);
        let prompt = self.params.prompt.clone();
        let text = self.accumulator.clone();
        self.params
            .cache
            .scan_or_join(
                fingerprint,
                async move { pipeline.run_detached(Some(prompt), text).await },
                store,
            )
            .await
    }

    /// EOF without a violation: run the final scan over the complete output
    /// unless the last windowed scan already covered exactly this length (in
    /// which case its verdict is cached as the final one). Always terminates
    /// OpenAI framing with the finish frame and `[DONE]`.
    async fn finish_stream(mut self) {
        if self.params.output_enabled {
            if self.scanned_len == Some(self.accumulator.len()) {
                if let Some(verdict) = self.last_verdict.take() {
                    let fingerprint = Fingerprint::compute(Side::Output, &self.accumulator);
                    self.params.cache.store(&fingerprint, &verdict).await;
                }
            } else {
                let verdict = self.scan_accumulator(true).await;
                if !verdict.allowed {
                    // The chunks already sent cannot be retracted; the
                    // terminal frame still marks the response as blocked.
                    self.upstream.cancel();
                    self.emit_violation(failed_scanners(&verdict)).await;
                    return;
                }
            }
        }

        match &mut self.shape {
            StreamShape::Native => {}
            StreamShape::OpenAiChat(state) => {
                let finish = state.finish();
                let mut frames = Vec::new();
                if let Some(frame) = finish
                    && let Ok(json) = serde_json::to_string(&frame)
                {
                    frames.push(sse::encode_data_frame(&json));
                }
                frames.push(sse::encode_done_frame());
                for frame in frames {
                    if self.tx.send(frame).await.is_err() {
                        return;
                    }
                }
            }
            StreamShape::OpenAiCompletion(state) => {
                let finish = state.finish();
                let mut frames = Vec::new();
                if let Some(frame) = finish
                    && let Ok(json) = serde_json::to_string(&frame)
                {
                    frames.push(sse::encode_data_frame(&json));
                }
                frames.push(sse::encode_done_frame());
                for frame in frames {
                    if self.tx.send(frame).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Exactly one terminal error frame in the stream's native framing.
    async fn emit_violation(&self, failed: Vec<FailedScanner>) {
        match &self.shape {
            StreamShape::Native => {
                let chunk = StreamErrorChunk::violation("output_blocked", failed);
                if let Ok(json) = serde_json::to_string(&chunk) {
                    let _ = self.tx.send(ndjson::encode_line(&json)).await;
                }
            }
            StreamShape::OpenAiChat(_) | StreamShape::OpenAiCompletion(_) => {
                let body = OpenAiErrorBody::new(
                    "generated content blocked by content safety scanners",
                    "content_policy_violation",
                    "output_blocked",
                )
                .with_failed_scanners(failed);
                if let Ok(json) = serde_json::to_string(&body) {
                    let _ = self.tx.send(sse::encode_data_frame(&json)).await;
                }
                let _ = self.tx.send(sse::encode_done_frame()).await;
            }
        }
    }

    async fn emit_upstream_failure(&self, failure: &UpstreamFailure) {
        let code = match failure.kind {
            UpstreamTransportErrorKind::Timeout | UpstreamTransportErrorKind::ReadTimeout => {
                "upstream_timeout"
            }
            _ => "upstream_error",
        };
        match &self.shape {
            StreamShape::Native => {
                let chunk = StreamErrorChunk {
                    done: true,
                    error: code.to_string(),
                    kind: code.to_string(),
                    failed_scanners: None,
                };
                if let Ok(json) = serde_json::to_string(&chunk) {
                    let _ = self.tx.send(ndjson::encode_line(&json)).await;
                }
            }
            StreamShape::OpenAiChat(_) | StreamShape::OpenAiCompletion(_) => {
                let body = OpenAiErrorBody::new(failure.message.clone(), "upstream_error", code);
                if let Ok(json) = serde_json::to_string(&body) {
                    let _ = self.tx.send(sse::encode_data_frame(&json)).await;
                }
                let _ = self.tx.send(sse::encode_done_frame()).await;
            }
        }
    }
}
