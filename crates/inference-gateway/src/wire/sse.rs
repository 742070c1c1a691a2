//! Incremental server-sent-event line parsing.
//!
//! Response bodies arrive in arbitrary chunks, so bytes are buffered until a
//! full line is available. Lines are decoded only once complete, which keeps
//! multi-byte characters split across chunks intact.

/// Terminator sent by OpenAI-shaped upstreams.
pub const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buf: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every complete line, without the line
    /// terminator. Empty lines are kept because they delimit events.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Whatever is left once the body ends without a trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string())
    }
}

/// Payload of a `data:` line. Accepts both `data: x` and `data:x`.
pub fn data_payload(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Name of an `event:` line.
pub fn event_name(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("event:")?;
    Some(rest.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_across_chunks() {
        let mut buf = SseLineBuffer::new();
        assert!(buf.push(b"data: {\"a\"").is_empty());
        let lines = buf.push(b":1}\n\ndata: [DONE]\n");
        assert_eq!(lines, vec!["data: {\"a\":1}", "", "data: [DONE]"]);
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn test_multibyte_character_split_between_chunks() {
        let text = "data: héllo\n".as_bytes();
        // split inside the two-byte 'é'
        let (a, b) = text.split_at(8);
        let mut buf = SseLineBuffer::new();
        assert!(buf.push(a).is_empty());
        assert_eq!(buf.push(b), vec!["data: héllo"]);
    }

    #[test]
    fn test_crlf_terminators() {
        let mut buf = SseLineBuffer::new();
        assert_eq!(buf.push(b"data: x\r\n"), vec!["data: x"]);
    }

    #[test]
    fn test_data_payload_with_and_without_space() {
        assert_eq!(data_payload("data: [DONE]"), Some("[DONE]"));
        assert_eq!(data_payload("data:[DONE]"), Some("[DONE]"));
        assert_eq!(data_payload("event: error"), None);
        assert_eq!(event_name("event: error"), Some("error"));
    }

    #[test]
    fn test_finish_returns_partial_line() {
        let mut buf = SseLineBuffer::new();
        buf.push(b"data: tail");
        assert_eq!(buf.finish().as_deref(), Some("data: tail"));
    }
}
