use bytes::Bytes;

/// Encode one `data:` frame. Multi-line data gets one `data:` prefix per line.
pub fn encode_data_frame(data: &str) -> Bytes {
    let mut out = String::new();
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

/// The terminal frame OpenAI-dialect streams end with.
pub fn encode_done_frame() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_frame() {
        let frame = encode_data_frame("{\"x\":1}");
        assert_eq!(&frame[..], b"data: {\"x\":1}\n\n");
    }

    #[test]
    fn multi_line_data_gets_prefix_per_line() {
        let frame = encode_data_frame("one\ntwo");
        assert_eq!(&frame[..], b"data: one\ndata: two\n\n");
    }

    #[test]
    fn done_frame_shape() {
        assert_eq!(&encode_done_frame()[..], b"data: [DONE]\n\n");
    }
}
