use oguard_protocol::ollama::chat::{ChatRequest, ChatResponse};
use oguard_protocol::ollama::generate::{GenerateRequest, GenerateResponse};
use oguard_protocol::openai::chat_completions::ChatCompletionRequest;
use oguard_protocol::openai::completions::CompletionRequest;

/// Scan text for a native generate request: the prompt as-is.
pub fn generate_input_text(request: &GenerateRequest) -> String {
    request.prompt.clone()
}

/// Scan text for a native chat request: messages in dialog order with role
/// prefixes, so classifiers see who said what.
pub fn chat_input_text(request: &ChatRequest) -> String {
    join_role_lines(
        request
            .messages
            .iter()
            .map(|message| (message.role.as_str(), message.content.as_str())),
    )
}

/// Scan text for an OpenAI chat-completions request.
pub fn openai_chat_input_text(request: &ChatCompletionRequest) -> String {
    let mut out = String::new();
    for message in &request.messages {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&message.role);
        out.push_str(": ");
        out.push_str(&message.content.as_text());
    }
    out
}

/// Scan text for an OpenAI completion request.
pub fn openai_completion_input_text(request: &CompletionRequest) -> String {
    request.prompt.joined()
}

/// Output delta carried by one native chat NDJSON chunk.
pub fn chat_output_delta(chunk: &ChatResponse) -> &str {
    chunk
        .message
        .as_ref()
        .map(|message| message.content.as_str())
        .unwrap_or("")
}

/// Output delta carried by one native generate NDJSON chunk.
pub fn generate_output_delta(chunk: &GenerateResponse) -> &str {
    &chunk.response
}

fn join_role_lines<'a>(lines: impl Iterator<Item = (&'a str, &'a str)>) -> String {
    let mut out = String::new();
    for (role, content) in lines {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(role);
        out.push_str(": ");
        out.push_str(content);
    }
    out
}
