use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use super::chat_completions::Usage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingsInput {
    Single(String),
    Batch(Vec<String>),
}

impl Default for EmbeddingsInput {
    fn default() -> Self {
        EmbeddingsInput::Single(String::new())
    }
}

impl EmbeddingsInput {
    pub fn joined(&self) -> String {
        match self {
            EmbeddingsInput::Single(text) => text.clone(),
            EmbeddingsInput::Batch(items) => items.join("\n"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingsRequest {
    pub model: String,
    #[serde(default)]
    pub input: EmbeddingsInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListObject {
    #[serde(rename = "list")]
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbeddingObject {
    #[serde(rename = "embedding")]
    Embedding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingEntry {
    pub object: EmbeddingObject,
    pub index: i64,
    pub embedding: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsResponse {
    pub object: ListObject,
    pub data: Vec<EmbeddingEntry>,
    pub model: String,
    pub usage: Usage,
}
