use oguard_protocol::ollama::chat::ChatResponse;
use oguard_protocol::ollama::generate::GenerateResponse;
use oguard_protocol::openai::chat_completions::ChatCompletionChunk;
use oguard_protocol::openai::completions::CompletionChunk;

use crate::extract;

fn finish_reason(done_reason: Option<&str>) -> String {
    match done_reason {
        Some("length") => "length".to_string(),
        _ => "stop".to_string(),
    }
}

/// Per-stream state turning native chat NDJSON chunks into OpenAI SSE chunk
/// payloads. The terminal `finish_reason` frame is emitted exactly once, on
/// the native `done:true` chunk or at EOF, whichever comes first.
#[derive(Debug, Default)]
pub struct ChatStreamState {
    finish_emitted: bool,
}

impl ChatStreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transform_chunk(&mut self, chunk: &ChatResponse) -> Vec<ChatCompletionChunk> {
        let mut out = Vec::new();
        let content = extract::chat_output_delta(chunk);
        if !content.is_empty() {
            out.push(ChatCompletionChunk::delta(content));
        }
        if chunk.done && !self.finish_emitted {
            self.finish_emitted = true;
            out.push(ChatCompletionChunk::finish(finish_reason(
                chunk.done_reason.as_deref(),
            )));
        }
        out
    }

    /// EOF fallback for upstreams that close without a `done:true` chunk.
    pub fn finish(&mut self) -> Option<ChatCompletionChunk> {
        if self.finish_emitted {
            return None;
        }
        self.finish_emitted = true;
        Some(ChatCompletionChunk::finish("stop"))
    }
}

/// Per-stream state turning native generate NDJSON chunks into OpenAI text
/// completion SSE chunk payloads.
#[derive(Debug, Default)]
pub struct CompletionStreamState {
    finish_emitted: bool,
}

impl CompletionStreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transform_chunk(&mut self, chunk: &GenerateResponse) -> Vec<CompletionChunk> {
        let mut out = Vec::new();
        let text = extract::generate_output_delta(chunk);
        if !text.is_empty() {
            out.push(CompletionChunk::delta(text));
        }
        if chunk.done && !self.finish_emitted {
            self.finish_emitted = true;
            out.push(CompletionChunk::finish(finish_reason(
                chunk.done_reason.as_deref(),
            )));
        }
        out
    }

    pub fn finish(&mut self) -> Option<CompletionChunk> {
        if self.finish_emitted {
            return None;
        }
        self.finish_emitted = true;
        Some(CompletionChunk::finish("stop"))
    }
}
