#[derive(Debug, thiserror::Error)]
pub enum ScannerError {
    #[error("{0}")]
    Failed(String),
}

/// Result of one scanner invocation. `sanitized` is the (possibly rewritten)
/// text handed to the next scanner in the pipeline.
#[derive(Debug, Clone)]
pub struct Scanned {
    pub sanitized: String,
    pub passed: bool,
    /// Informational risk score in [0, 1]; never used for allow/deny.
    pub risk: f64,
}

impl Scanned {
    pub fn pass(sanitized: impl Into<String>) -> Self {
        Self {
            sanitized: sanitized.into(),
            passed: true,
            risk: 0.0,
        }
    }

    pub fn fail(sanitized: impl Into<String>, risk: f64) -> Self {
        Self {
            sanitized: sanitized.into(),
            passed: false,
            risk,
        }
    }
}

/// A content-safety scanner. Implementations are constructed once at startup,
/// shared read-only across requests, and may hold heavy resources. Input-side
/// invocations get `prompt: None`; output-side invocations receive the
/// original prompt as context.
///
/// Scanners must not panic for failure modes they can anticipate; the
/// pipeline maps `Err` to a failed verdict for that scanner only.
pub trait Scanner: Send + Sync {
    fn name(&self) -> &str;

    fn scan(&self, prompt: Option<&str>, text: &str) -> Result<Scanned, ScannerError>;
}
