use oguard_protocol::ollama::chat::ChatResponse;
use oguard_protocol::ollama::embed::EmbedResponse;
use oguard_protocol::ollama::generate::GenerateResponse;
use oguard_protocol::ollama::manage::TagsResponse;
use oguard_protocol::openai::chat_completions::{
    ChatChoice, ChatCompletionObject, ChatCompletionResponse, ResponseMessage, Usage,
};
use oguard_protocol::openai::completions::{
    CompletionChoice, CompletionResponse, TextCompletionObject,
};
use oguard_protocol::openai::embeddings::{
    EmbeddingEntry, EmbeddingObject, EmbeddingsResponse, ListObject,
};
use oguard_protocol::openai::models::{ModelEntry, ModelList, ModelObject};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Token usage from the native eval counters; zero when the backend omitted
/// them (best-effort per the OpenAI compatibility contract).
fn usage_from_counts(prompt_eval: Option<u64>, eval: Option<u64>) -> Usage {
    Usage::from_counts(prompt_eval.unwrap_or(0), eval.unwrap_or(0))
}

fn finish_reason(done_reason: Option<&str>) -> Option<String> {
    match done_reason {
        Some("length") => Some("length".to_string()),
        _ => Some("stop".to_string()),
    }
}

/// Wrap a non-streaming native chat response as an OpenAI chat completion.
pub fn chat_to_openai(id: String, native: &ChatResponse) -> ChatCompletionResponse {
    let content = native
        .message
        .as_ref()
        .map(|message| message.content.clone())
        .unwrap_or_default();

    ChatCompletionResponse {
        id,
        object: ChatCompletionObject::ChatCompletion,
        created: now_unix(),
        model: native.model.clone().unwrap_or_default(),
        choices: vec![ChatChoice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content,
            },
            finish_reason: finish_reason(native.done_reason.as_deref()),
        }],
        usage: Some(usage_from_counts(native.prompt_eval_count, native.eval_count)),
    }
}

/// Wrap a non-streaming native generate response as an OpenAI text completion.
pub fn generate_to_openai(id: String, native: &GenerateResponse) -> CompletionResponse {
    CompletionResponse {
        id,
        object: TextCompletionObject::TextCompletion,
        created: now_unix(),
        model: native.model.clone().unwrap_or_default(),
        choices: vec![CompletionChoice {
            index: 0,
            text: native.response.clone(),
            finish_reason: finish_reason(native.done_reason.as_deref()),
        }],
        usage: Some(usage_from_counts(native.prompt_eval_count, native.eval_count)),
    }
}

/// Wrap a native embed response as an OpenAI embeddings response.
pub fn embed_to_openai(model: String, native: &EmbedResponse) -> EmbeddingsResponse {
    let data = native
        .embeddings
        .iter()
        .enumerate()
        .map(|(index, embedding)| EmbeddingEntry {
            object: EmbeddingObject::Embedding,
            index: index as i64,
            embedding: embedding.clone(),
        })
        .collect();

    EmbeddingsResponse {
        object: ListObject::List,
        data,
        model,
        usage: Usage::from_counts(native.prompt_eval_count.unwrap_or(0), 0),
    }
}

/// Convert the native tags listing to the OpenAI models list.
pub fn tags_to_models(native: &TagsResponse) -> ModelList {
    let data = native
        .models
        .iter()
        .map(|model| ModelEntry {
            id: model.name.clone(),
            object: ModelObject::Model,
            created: model
                .modified_at
                .as_deref()
                .and_then(|stamp| OffsetDateTime::parse(stamp, &Rfc3339).ok())
                .map(|at| at.unix_timestamp())
                .unwrap_or_else(now_unix),
            owned_by: "library".to_string(),
        })
        .collect();

    ModelList {
        object: ListObject::List,
        data,
    }
}
