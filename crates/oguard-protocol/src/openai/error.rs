use serde::{Deserialize, Serialize};

use crate::FailedScanner;

/// OpenAI-dialect error body: `{error: {message, type, code, failed_scanners?}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiErrorBody {
    pub error: OpenAiError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiError {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_scanners: Option<Vec<FailedScanner>>,
}

impl OpenAiErrorBody {
    pub fn new(message: impl Into<String>, kind: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: OpenAiError {
                message: message.into(),
                kind: kind.into(),
                code: Some(code.into()),
                failed_scanners: None,
            },
        }
    }

    pub fn with_failed_scanners(mut self, failed: Vec<FailedScanner>) -> Self {
        if !failed.is_empty() {
            self.error.failed_scanners = Some(failed);
        }
        self
    }
}
