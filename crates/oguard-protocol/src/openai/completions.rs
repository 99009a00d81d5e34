use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use super::chat_completions::{StopConfiguration, Usage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptInput {
    One(String),
    Many(Vec<String>),
}

impl Default for PromptInput {
    fn default() -> Self {
        PromptInput::One(String::new())
    }
}

impl PromptInput {
    pub fn joined(&self) -> String {
        match self {
            PromptInput::One(prompt) => prompt.clone(),
            PromptInput::Many(prompts) => prompts.join("\n"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    #[serde(default)]
    pub prompt: PromptInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextCompletionObject {
    #[serde(rename = "text_completion")]
    TextCompletion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: i64,
    pub text: String,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: TextCompletionObject,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Streaming completion chunk, minimal like the chat variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChunk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<TextCompletionObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub choices: Vec<CompletionChoice>,
}

impl CompletionChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            id: None,
            object: None,
            created: None,
            model: None,
            choices: vec![CompletionChoice {
                index: 0,
                text: text.into(),
                finish_reason: None,
            }],
        }
    }

    pub fn finish(reason: impl Into<String>) -> Self {
        Self {
            id: None,
            object: None,
            created: None,
            model: None,
            choices: vec![CompletionChoice {
                index: 0,
                text: String::new(),
                finish_reason: Some(reason.into()),
            }],
        }
    }
}
