//! Newline-framed JSON codec.
//!
//! Each message is one JSON value per line. Chunks arriving off a byte
//! stream rarely align with line boundaries, so the decoder buffers
//! the trailing fragment of every chunk until its terminating newline
//! arrives. A line that fails to parse is logged and skipped; it never
//! terminates the reader.

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{WireError, WireResult};

/// Encode one message as a newline-terminated JSON line.
///
/// # Errors
///
/// Returns [`WireError::Encode`] if serialization fails.
pub fn encode_line<T: Serialize>(message: &T) -> WireResult<String> {
    let mut line = serde_json::to_string(message).map_err(WireError::Encode)?;
    line.push('\n');
    Ok(line)
}

/// Reassembles newline-framed JSON values from arbitrary byte chunks.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every complete JSON value it
    /// completes. The fragment after the last newline (possibly
    /// empty) is retained for the next chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);

        let mut decoded = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&byte| byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = &line[..newline];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<Value>(line) {
                Ok(value) => decoded.push(value),
                Err(error) => {
                    warn!(
                        error = %error,
                        line = %String::from_utf8_lossy(line),
                        "Skipping undecodable line"
                    );
                },
            }
        }
        decoded
    }

    /// Bytes currently buffered awaiting a newline.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn split_chunks_reassemble_into_one_message() {
        let mut decoder = LineDecoder::new();

        let first = decoder.push(b"{\"type\":");
        assert!(first.is_empty());
        assert!(decoder.buffered() > 0);

        let second = decoder.push(b"\"boot\"}\n");
        assert_eq!(second, vec![json!({"type": "boot"})]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn multiple_lines_in_one_chunk() {
        let mut decoder = LineDecoder::new();
        let values = decoder.push(b"{\"a\":1}\n{\"b\":2}\n{\"c\":");
        assert_eq!(values, vec![json!({"a": 1}), json!({"b": 2})]);
        assert!(decoder.buffered() > 0);

        let values = decoder.push(b"3}\n");
        assert_eq!(values, vec![json!({"c": 3})]);
    }

    #[test]
    fn bad_line_is_skipped_not_fatal() {
        let mut decoder = LineDecoder::new();
        let values = decoder.push(b"this is not json\n{\"ok\":true}\n");
        assert_eq!(values, vec![json!({"ok": true})]);
    }

    #[test]
    fn blank_lines_are_ignored() {
        let mut decoder = LineDecoder::new();
        let values = decoder.push(b"\n  \n{\"ok\":1}\n");
        assert_eq!(values, vec![json!({"ok": 1})]);
    }

    #[test]
    fn encode_appends_exactly_one_newline() {
        let line = encode_line(&json!({"x": 1})).unwrap();
        let body = line.strip_suffix('\n').unwrap();
        assert!(!body.contains('\n'));
    }
}
