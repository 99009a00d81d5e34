use bytes::Bytes;

/// Incremental splitter for newline-delimited JSON streams. Partial lines are
/// buffered until their terminating newline arrives; non-JSON noise lines are
/// dropped.
#[derive(Debug, Default)]
pub struct NdjsonSplitter {
    buffer: String,
}

impl NdjsonSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<String> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut lines = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
                continue;
            }
            lines.push(trimmed.to_string());
        }

        lines
    }

    /// Flush a trailing line that never got its newline (some upstreams end
    /// the stream without one).
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        let trimmed = line.trim();
        if trimmed.is_empty() || !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
            return None;
        }
        Some(trimmed.to_string())
    }
}

/// Encode one NDJSON line from an already-serialized JSON object.
pub fn encode_line(json: &str) -> Bytes {
    let mut out = String::with_capacity(json.len() + 1);
    out.push_str(json);
    out.push('\n');
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_complete_lines() {
        let mut splitter = NdjsonSplitter::new();
        let lines = splitter.push_str("{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn buffers_partial_lines() {
        let mut splitter = NdjsonSplitter::new();
        assert!(splitter.push_str("{\"a\"").is_empty());
        let lines = splitter.push_str(":1}\n");
        assert_eq!(lines, vec!["{\"a\":1}"]);
    }

    #[test]
    fn drops_noise_lines() {
        let mut splitter = NdjsonSplitter::new();
        let lines = splitter.push_str("\nnot json\n{\"ok\":true}\n");
        assert_eq!(lines, vec!["{\"ok\":true}"]);
    }

    #[test]
    fn finish_returns_trailing_object() {
        let mut splitter = NdjsonSplitter::new();
        assert!(splitter.push_str("{\"done\":true}").is_empty());
        assert_eq!(splitter.finish().as_deref(), Some("{\"done\":true}"));
        assert_eq!(splitter.finish(), None);
    }
}
