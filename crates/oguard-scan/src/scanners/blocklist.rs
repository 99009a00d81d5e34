use crate::scanner::{Scanned, Scanner, ScannerError};

/// Case-insensitive term blocklist. The text is never modified; a hit fails
/// the scan with full risk.
pub struct BlocklistScanner {
    name: String,
    terms: Vec<String>,
}

impl BlocklistScanner {
    pub fn new(name: impl Into<String>, terms: impl IntoIterator<Item = String>) -> Self {
        Self {
            name: name.into(),
            terms: terms
                .into_iter()
                .map(|term| term.trim().to_lowercase())
                .filter(|term| !term.is_empty())
                .collect(),
        }
    }

    fn first_hit(&self, text: &str) -> Option<&str> {
        let haystack = text.to_lowercase();
        self.terms
            .iter()
            .find(|term| haystack.contains(term.as_str()))
            .map(|term| term.as_str())
    }
}

impl Scanner for BlocklistScanner {
    fn name(&self) -> &str {
        &self.name
    }

    fn scan(&self, _prompt: Option<&str>, text: &str) -> Result<Scanned, ScannerError> {
        match self.first_hit(text) {
            Some(_) => Ok(Scanned::fail(text, 1.0)),
            None => Ok(Scanned::pass(text)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> BlocklistScanner {
        BlocklistScanner::new(
            "blocklist",
            ["FORBIDDEN".to_string(), "classified".to_string()],
        )
    }

    #[test]
    fn hit_fails_without_modifying() {
        let result = scanner().scan(None, "this is Forbidden content").unwrap();
        assert!(!result.passed);
        assert_eq!(result.risk, 1.0);
        assert_eq!(result.sanitized, "this is Forbidden content");
    }

    #[test]
    fn clean_text_passes() {
        let result = scanner().scan(None, "ordinary text").unwrap();
        assert!(result.passed);
        assert_eq!(result.risk, 0.0);
    }

    #[test]
    fn empty_term_list_passes_everything() {
        let scanner = BlocklistScanner::new("blocklist", Vec::new());
        assert!(scanner.scan(None, "anything").unwrap().passed);
    }
}
