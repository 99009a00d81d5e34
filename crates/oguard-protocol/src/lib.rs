pub mod ndjson;
pub mod ollama;
pub mod openai;
pub mod sse;

use serde::{Deserialize, Serialize};

/// Scanner verdict detail attached to violation responses in both dialects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedScanner {
    pub scanner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}
