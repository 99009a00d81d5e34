use regex::Regex;

use crate::scanner::{Scanned, Scanner, ScannerError};

const EMAIL_PATTERN: &str = r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}";
const PHONE_PATTERN: &str = r"\+?\d[\d\s().-]{7,}\d";

/// Redacts email addresses and phone-number-shaped tokens so downstream
/// scanners (and the backend) never see them. Always passes; redaction is
/// sanitization, not a violation.
pub struct PiiRedactScanner {
    name: String,
    email: Regex,
    phone: Regex,
}

impl PiiRedactScanner {
    pub fn new(name: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            email: Regex::new(EMAIL_PATTERN)?,
            phone: Regex::new(PHONE_PATTERN)?,
        })
    }
}

impl Scanner for PiiRedactScanner {
    fn name(&self) -> &str {
        &self.name
    }

    fn scan(&self, _prompt: Option<&str>, text: &str) -> Result<Scanned, ScannerError> {
        let redacted = self.email.replace_all(text, "[REDACTED_EMAIL]");
        let redacted = self.phone.replace_all(&redacted, "[REDACTED_PHONE]");
        let modified = redacted != text;
        Ok(Scanned {
            sanitized: redacted.into_owned(),
            passed: true,
            risk: if modified { 0.2 } else { 0.0 },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> PiiRedactScanner {
        PiiRedactScanner::new("pii-redact").unwrap()
    }

    #[test]
    fn redacts_email() {
        let result = scanner().scan(None, "mail me at jane@example.com please").unwrap();
        assert!(result.passed);
        assert_eq!(result.sanitized, "mail me at [REDACTED_EMAIL] please");
    }

    #[test]
    fn redacts_phone() {
        let result = scanner().scan(None, "call +1 (555) 123-4567 now").unwrap();
        assert!(result.passed);
        assert!(result.sanitized.contains("[REDACTED_PHONE]"));
        assert!(!result.sanitized.contains("555"));
    }

    #[test]
    fn clean_text_untouched() {
        let result = scanner().scan(None, "nothing personal here").unwrap();
        assert_eq!(result.sanitized, "nothing personal here");
        assert_eq!(result.risk, 0.0);
    }
}
