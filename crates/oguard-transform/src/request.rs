use oguard_protocol::ollama::chat::{ChatMessage, ChatRequest};
use oguard_protocol::ollama::embed::{EmbedInput, EmbedRequest};
use oguard_protocol::ollama::generate::GenerateRequest;
use oguard_protocol::ollama::options::ModelOptions;
use oguard_protocol::openai::chat_completions::ChatCompletionRequest;
use oguard_protocol::openai::completions::CompletionRequest;
use oguard_protocol::openai::embeddings::{EmbeddingsInput, EmbeddingsRequest};

/// Convert an OpenAI chat-completions request into a native chat request.
///
/// Honored options: temperature, top_p, max_tokens/max_completion_tokens
/// (num_predict), stop, seed, frequency_penalty (repeat_penalty). Everything
/// else is dropped, never rejected.
pub fn chat_completion_to_native(request: ChatCompletionRequest) -> ChatRequest {
    let messages = request
        .messages
        .iter()
        .map(|message| ChatMessage::new(message.role.clone(), message.content.as_text()))
        .collect();

    let options = collect_options(
        request.temperature,
        request.top_p,
        request.max_completion_tokens.or(request.max_tokens),
        request.stop.clone().map(|stop| stop.into_vec()),
        request.seed,
        request.frequency_penalty,
    );

    ChatRequest {
        model: request.model,
        messages,
        stream: Some(request.stream.unwrap_or(false)),
        options,
        ..ChatRequest::default()
    }
}

/// Convert an OpenAI text-completion request into a native generate request.
pub fn completion_to_native(request: CompletionRequest) -> GenerateRequest {
    let options = collect_options(
        request.temperature,
        request.top_p,
        request.max_tokens,
        request.stop.clone().map(|stop| stop.into_vec()),
        request.seed,
        request.frequency_penalty,
    );

    GenerateRequest {
        model: request.model,
        prompt: request.prompt.joined(),
        suffix: request.suffix,
        stream: Some(request.stream.unwrap_or(false)),
        options,
        ..GenerateRequest::default()
    }
}

/// Convert an OpenAI embeddings request into a native embed request.
pub fn embeddings_to_native(request: EmbeddingsRequest) -> EmbedRequest {
    let input = match request.input {
        EmbeddingsInput::Single(text) => EmbedInput::Single(text),
        EmbeddingsInput::Batch(items) => EmbedInput::Batch(items),
    };
    EmbedRequest {
        model: request.model,
        input,
        ..EmbedRequest::default()
    }
}

fn collect_options(
    temperature: Option<f64>,
    top_p: Option<f64>,
    max_tokens: Option<i64>,
    stop: Option<Vec<String>>,
    seed: Option<i64>,
    frequency_penalty: Option<f64>,
) -> Option<ModelOptions> {
    let options = ModelOptions {
        temperature,
        top_p,
        num_predict: max_tokens,
        stop,
        seed,
        repeat_penalty: frequency_penalty,
        ..ModelOptions::default()
    };
    if options.is_empty() { None } else { Some(options) }
}
