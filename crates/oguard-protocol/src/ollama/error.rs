use serde::{Deserialize, Serialize};

use crate::FailedScanner;

/// Native-dialect error body: `{error, type, message, failed_scanners?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeErrorBody {
    pub error: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_scanners: Option<Vec<FailedScanner>>,
}

impl NativeErrorBody {
    pub fn new(error: impl Into<String>, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            kind: Some(kind.into()),
            message: Some(message.into()),
            failed_scanners: None,
        }
    }

    pub fn with_failed_scanners(mut self, failed: Vec<FailedScanner>) -> Self {
        if !failed.is_empty() {
            self.failed_scanners = Some(failed);
        }
        self
    }
}

/// Terminal NDJSON line emitted when a streaming response is cut off by the
/// output guard. Carries `done:true` so native clients stop reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamErrorChunk {
    pub done: bool,
    pub error: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_scanners: Option<Vec<FailedScanner>>,
}

impl StreamErrorChunk {
    pub fn violation(kind: impl Into<String>, failed: Vec<FailedScanner>) -> Self {
        Self {
            done: true,
            error: "content_policy_violation".to_string(),
            kind: kind.into(),
            failed_scanners: if failed.is_empty() { None } else { Some(failed) },
        }
    }
}
