/*!
 * Line framing for raw device output.
 *
 * Splits the byte stream on a single delimiter byte. A trailing carriage return
 * is dropped so CRLF devices produce the same lines as LF devices. Invalid UTF-8
 * is replaced rather than rejected: device consoles emit garbage during boot.
 */
use bytes::{Buf, BytesMut};

/// Lines longer than this are emitted in pieces
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Accumulates bytes and yields complete lines
#[derive(Debug)]
pub struct LineFramer {
    delimiter: u8,
    buffer: BytesMut,
}

impl LineFramer {
    /// Create a framer splitting on `delimiter`
    pub fn new(delimiter: u8) -> Self {
        Self {
            delimiter,
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Feed raw bytes; returns every line completed by them, in order
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(data);
        let mut lines = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == self.delimiter) {
            let raw = self.buffer.split_to(pos);
            self.buffer.advance(1);
            lines.push(decode(&raw));
        }

        while self.buffer.len() > MAX_LINE_LENGTH {
            let raw = self.buffer.split_to(MAX_LINE_LENGTH);
            lines.push(decode(&raw));
        }

        lines
    }

    /// Whether bytes are waiting for a delimiter
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Take whatever is buffered as a line, even without a delimiter
    pub fn take_partial(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let raw = self.buffer.split();
        Some(decode(&raw))
    }
}

fn decode(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_across_chunks() {
        let mut framer = LineFramer::new(b'\n');
        assert!(framer.push(b"boot").is_empty());
        assert!(framer.has_partial());
        assert_eq!(framer.push(b"ing\r\nready\nxx"), vec!["booting", "ready"]);
        assert_eq!(framer.take_partial().as_deref(), Some("xx"));
        assert!(!framer.has_partial());
        assert_eq!(framer.take_partial(), None);
    }

    #[test]
    fn test_custom_delimiter_and_empty_lines() {
        let mut framer = LineFramer::new(b'\0');
        assert_eq!(framer.push(b"a\0\0b\0"), vec!["a", "", "b"]);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut framer = LineFramer::new(b'\n');
        let lines = framer.push(b"ok\xff\n");
        assert_eq!(lines, vec!["ok\u{fffd}"]);
    }

    #[test]
    fn test_overlong_line_is_chunked() {
        let mut framer = LineFramer::new(b'\n');
        let data = vec![b'x'; MAX_LINE_LENGTH + 10];
        let lines = framer.push(&data);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), MAX_LINE_LENGTH);
        assert_eq!(framer.take_partial().map(|l| l.len()), Some(10));
    }
}
