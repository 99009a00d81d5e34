use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::scanner::Scanner;

/// Per-scanner verdict inside a [`ScanResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerOutcome {
    pub passed: bool,
    pub risk: f64,
    pub modified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate verdict of one pipeline run. Serializable so verdicts can live
/// in the remote cache tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub allowed: bool,
    pub sanitized: String,
    pub scanners: BTreeMap<String, ScannerOutcome>,
    pub scanner_count: usize,
}

impl ScanResult {
    /// Verdict for a run with no enabled scanners: everything passes and the
    /// text is untouched.
    pub fn trivially_allowed(text: impl Into<String>) -> Self {
        Self {
            allowed: true,
            sanitized: text.into(),
            scanners: BTreeMap::new(),
            scanner_count: 0,
        }
    }

    /// Conservative verdict used when a pipeline task died before producing
    /// one (e.g. a scanner panic took the worker down).
    pub fn aborted() -> Self {
        let mut scanners = BTreeMap::new();
        scanners.insert(
            "pipeline".to_string(),
            ScannerOutcome {
                passed: false,
                risk: 1.0,
                modified: false,
                error: Some("scan aborted before completion".to_string()),
            },
        );
        Self {
            allowed: false,
            sanitized: String::new(),
            scanners,
            scanner_count: 0,
        }
    }

    /// The scanners that failed or errored, for `failed_scanners` payloads.
    pub fn failing(&self) -> impl Iterator<Item = (&String, &ScannerOutcome)> {
        self.scanners
            .iter()
            .filter(|(_, outcome)| !outcome.passed)
    }
}

struct Entry {
    scanner: Arc<dyn Scanner>,
    enabled: AtomicBool,
}

/// An ordered, error-isolated scanner sequence. Two instances exist per
/// process (input and output side); `enabled` flags may be toggled at runtime
/// without coordination with in-flight scans.
pub struct Pipeline {
    entries: Vec<Entry>,
    block_on_scanner_error: bool,
}

impl Pipeline {
    pub fn new(scanners: Vec<Arc<dyn Scanner>>, block_on_scanner_error: bool) -> Self {
        Self {
            entries: scanners
                .into_iter()
                .map(|scanner| Entry {
                    scanner,
                    enabled: AtomicBool::new(true),
                })
                .collect(),
            block_on_scanner_error,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Toggle a scanner by name. Returns false when no scanner matches.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        for entry in &self.entries {
            if entry.scanner.name() == name {
                entry.enabled.store(enabled, Ordering::Relaxed);
                return true;
            }
        }
        false
    }

    /// Current (name, enabled) view, in pipeline order.
    pub fn scanners(&self) -> Vec<(String, bool)> {
        self.entries
            .iter()
            .map(|entry| {
                (
                    entry.scanner.name().to_string(),
                    entry.enabled.load(Ordering::Relaxed),
                )
            })
            .collect()
    }

    /// Run every enabled scanner in order, accumulating sanitization.
    ///
    /// A scanner error never suppresses the rest of the sequence (unless
    /// `block_on_scanner_error` aborts the run); it records a failed outcome
    /// for that scanner alone. Errored and failed scanners both clear
    /// `allowed`.
    pub fn run(&self, prompt: Option<&str>, text: &str) -> ScanResult {
        let mut sanitized = text.to_string();
        let mut scanners = BTreeMap::new();
        let mut allowed = true;
        let mut enabled_count = 0usize;

        for entry in &self.entries {
            if !entry.enabled.load(Ordering::Relaxed) {
                continue;
            }
            enabled_count += 1;
            let name = entry.scanner.name().to_string();

            match entry.scanner.scan(prompt, &sanitized) {
                Ok(scanned) => {
                    let modified = scanned.sanitized != sanitized;
                    if !scanned.passed {
                        allowed = false;
                    }
                    scanners.insert(
                        name,
                        ScannerOutcome {
                            passed: scanned.passed,
                            risk: scanned.risk.clamp(0.0, 1.0),
                            modified,
                            error: None,
                        },
                    );
                    sanitized = scanned.sanitized;
                }
                Err(err) => {
                    warn!(scanner = %name, error = %err, "scanner error");
                    scanners.insert(
                        name,
                        ScannerOutcome {
                            passed: false,
                            risk: 1.0,
                            modified: false,
                            error: Some(err.to_string()),
                        },
                    );
                    allowed = false;
                    if self.block_on_scanner_error {
                        break;
                    }
                }
            }
        }

        ScanResult {
            allowed,
            sanitized,
            scanners,
            scanner_count: enabled_count,
        }
    }

    /// Run on the blocking worker pool so compute-heavy scanners cannot
    /// starve the I/O tasks.
    pub async fn run_detached(
        self: &Arc<Self>,
        prompt: Option<String>,
        text: String,
    ) -> ScanResult {
        let pipeline = Arc::clone(self);
        match tokio::task::spawn_blocking(move || pipeline.run(prompt.as_deref(), &text)).await {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "scan worker task failed");
                ScanResult::aborted()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{Scanned, Scanner, ScannerError};

    struct PassThrough(&'static str);

    impl Scanner for PassThrough {
        fn name(&self) -> &str {
            self.0
        }
        fn scan(&self, _prompt: Option<&str>, text: &str) -> Result<Scanned, ScannerError> {
            Ok(Scanned::pass(text))
        }
    }

    struct Rejecting(&'static str);

    impl Scanner for Rejecting {
        fn name(&self) -> &str {
            self.0
        }
        fn scan(&self, _prompt: Option<&str>, text: &str) -> Result<Scanned, ScannerError> {
            Ok(Scanned::fail(text, 0.9))
        }
    }

    struct Erroring(&'static str);

    impl Scanner for Erroring {
        fn name(&self) -> &str {
            self.0
        }
        fn scan(&self, _prompt: Option<&str>, _text: &str) -> Result<Scanned, ScannerError> {
            Err(ScannerError::Failed("model not loaded".to_string()))
        }
    }

    struct Redacting;

    impl Scanner for Redacting {
        fn name(&self) -> &str {
            "redact"
        }
        fn scan(&self, _prompt: Option<&str>, text: &str) -> Result<Scanned, ScannerError> {
            Ok(Scanned::pass(text.replace("secret", "[GONE]")))
        }
    }

    struct SeesSanitized;

    impl Scanner for SeesSanitized {
        fn name(&self) -> &str {
            "sees-sanitized"
        }
        fn scan(&self, _prompt: Option<&str>, text: &str) -> Result<Scanned, ScannerError> {
            // Fails only when the upstream redaction did not happen first.
            if text.contains("secret") {
                Ok(Scanned::fail(text, 1.0))
            } else {
                Ok(Scanned::pass(text))
            }
        }
    }

    #[test]
    fn identity_pipeline_returns_input_unchanged() {
        let pipeline = Pipeline::new(
            vec![Arc::new(PassThrough("a")), Arc::new(PassThrough("b"))],
            false,
        );
        let result = pipeline.run(None, "hello");
        assert!(result.allowed);
        assert_eq!(result.sanitized, "hello");
        assert_eq!(result.scanner_count, 2);
        assert!(result.scanners.values().all(|o| o.passed && !o.modified));
    }

    #[test]
    fn sanitization_flows_downstream() {
        let pipeline = Pipeline::new(
            vec![Arc::new(Redacting), Arc::new(SeesSanitized)],
            false,
        );
        let result = pipeline.run(None, "the secret plan");
        assert!(result.allowed);
        assert_eq!(result.sanitized, "the [GONE] plan");
        assert!(result.scanners["redact"].modified);
        assert!(result.scanners["sees-sanitized"].passed);
    }

    #[test]
    fn one_failure_clears_allowed_but_runs_all() {
        let pipeline = Pipeline::new(
            vec![
                Arc::new(PassThrough("a")),
                Arc::new(Rejecting("deny")),
                Arc::new(PassThrough("z")),
            ],
            false,
        );
        let result = pipeline.run(None, "text");
        assert!(!result.allowed);
        assert_eq!(result.scanners.len(), 3);
        assert!(result.scanners["z"].passed);
        let failing: Vec<_> = result.failing().map(|(name, _)| name.clone()).collect();
        assert_eq!(failing, vec!["deny".to_string()]);
    }

    #[test]
    fn scanner_error_is_isolated() {
        let pipeline = Pipeline::new(
            vec![Arc::new(Erroring("broken")), Arc::new(PassThrough("after"))],
            false,
        );
        let result = pipeline.run(None, "text");
        assert!(!result.allowed);
        assert_eq!(result.scanners.len(), 2);
        assert_eq!(
            result.scanners["broken"].error.as_deref(),
            Some("model not loaded")
        );
        assert!(result.scanners["after"].passed);
    }

    #[test]
    fn block_on_scanner_error_aborts_run() {
        let pipeline = Pipeline::new(
            vec![Arc::new(Erroring("broken")), Arc::new(PassThrough("after"))],
            true,
        );
        let result = pipeline.run(None, "text");
        assert!(!result.allowed);
        assert_eq!(result.scanners.len(), 1);
        assert!(!result.scanners.contains_key("after"));
    }

    #[test]
    fn disabled_scanner_is_skipped() {
        let pipeline = Pipeline::new(
            vec![Arc::new(Rejecting("deny")), Arc::new(PassThrough("ok"))],
            false,
        );
        assert!(pipeline.set_enabled("deny", false));
        let result = pipeline.run(None, "text");
        assert!(result.allowed);
        assert_eq!(result.scanner_count, 1);
        assert!(!result.scanners.contains_key("deny"));
        assert!(!pipeline.set_enabled("missing", true));
    }

    #[test]
    fn output_side_receives_prompt() {
        struct WantsPrompt;
        impl Scanner for WantsPrompt {
            fn name(&self) -> &str {
                "wants-prompt"
            }
            fn scan(&self, prompt: Option<&str>, text: &str) -> Result<Scanned, ScannerError> {
                assert_eq!(prompt, Some("the prompt"));
                Ok(Scanned::pass(text))
            }
        }
        let pipeline = Pipeline::new(vec![Arc::new(WantsPrompt)], false);
        assert!(pipeline.run(Some("the prompt"), "output").allowed);
    }
}
