use bytes::Bytes;
use http::StatusCode;

use oguard_protocol::FailedScanner;
use oguard_protocol::ollama::NativeErrorBody;
use oguard_protocol::openai::OpenAiErrorBody;
use oguard_scan::ScanResult;

/// Which error body shape a response surface expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDialect {
    Native,
    OpenAi,
}

/// Request-terminating errors, one variant per canonical status.
#[derive(Debug, Clone)]
pub enum GuardError {
    InputBlocked { failed: Vec<FailedScanner> },
    OutputBlocked { failed: Vec<FailedScanner> },
    QueueFull { retry_after_secs: u64 },
    UpstreamUnavailable { message: String },
    UpstreamTimeout { message: String },
    BadRequest { message: String },
}

impl GuardError {
    pub fn status(&self) -> StatusCode {
        match self {
            GuardError::InputBlocked { .. } | GuardError::OutputBlocked { .. } => {
                StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS
            }
            GuardError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GuardError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            GuardError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GuardError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GuardError::QueueFull { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            GuardError::InputBlocked { .. } => "input_blocked",
            GuardError::OutputBlocked { .. } => "output_blocked",
            GuardError::QueueFull { .. } => "queue_full",
            GuardError::UpstreamUnavailable { .. } => "upstream_unavailable",
            GuardError::UpstreamTimeout { .. } => "upstream_timeout",
            GuardError::BadRequest { .. } => "bad_request",
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            GuardError::InputBlocked { .. } | GuardError::OutputBlocked { .. } => {
                "content_policy_violation"
            }
            GuardError::QueueFull { .. } => "overloaded",
            GuardError::UpstreamUnavailable { .. } | GuardError::UpstreamTimeout { .. } => {
                "upstream_error"
            }
            GuardError::BadRequest { .. } => "invalid_request_error",
        }
    }

    fn message(&self) -> String {
        match self {
            GuardError::InputBlocked { .. } => {
                "prompt blocked by content safety scanners".to_string()
            }
            GuardError::OutputBlocked { .. } => {
                "generated content blocked by content safety scanners".to_string()
            }
            GuardError::QueueFull { retry_after_secs } => {
                format!("model queue full, retry in {retry_after_secs}s")
            }
            GuardError::UpstreamUnavailable { message } => {
                format!("upstream unreachable: {message}")
            }
            GuardError::UpstreamTimeout { message } => format!("upstream timed out: {message}"),
            GuardError::BadRequest { message } => message.clone(),
        }
    }

    fn failed(&self) -> Vec<FailedScanner> {
        match self {
            GuardError::InputBlocked { failed } | GuardError::OutputBlocked { failed } => {
                failed.clone()
            }
            _ => Vec::new(),
        }
    }

    /// Serialize the body in the requested dialect.
    pub fn body_bytes(&self, dialect: ErrorDialect) -> Bytes {
        let serialized = match dialect {
            ErrorDialect::Native => serde_json::to_vec(
                &NativeErrorBody::new(self.kind(), self.code(), self.message())
                    .with_failed_scanners(self.failed()),
            ),
            ErrorDialect::OpenAi => serde_json::to_vec(
                &OpenAiErrorBody::new(self.message(), self.kind(), self.code())
                    .with_failed_scanners(self.failed()),
            ),
        };
        match serialized {
            Ok(body) => Bytes::from(body),
            Err(_) => Bytes::from_static(b"{\"error\":\"internal\"}"),
        }
    }
}

/// The `failed_scanners` detail for a blocked verdict.
pub fn failed_scanners(verdict: &ScanResult) -> Vec<FailedScanner> {
    verdict
        .failing()
        .map(|(name, outcome)| FailedScanner {
            scanner: name.clone(),
            reason: Some(
                outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "content flagged".to_string()),
            ),
            score: Some(outcome.risk),
        })
        .collect()
}
