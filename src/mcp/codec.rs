//! Line framing for the shell's stdout and stderr pipes.
//!
//! Lines are decoded lossily (a command printing invalid UTF-8 must not stall
//! the session) and capped at [`MAX_LINE_BYTES`]: a longer run of bytes
//! without a newline is emitted in chunks instead of growing the buffer
//! without bound.

use std::io;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Maximum bytes emitted as a single line.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Newline-delimited decoder that never fails on content.
#[derive(Debug, Clone)]
pub struct ShellLineCodec {
    max_length: usize,
    /// Bytes already scanned for a newline on a previous call.
    next_index: usize,
}

impl ShellLineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
            next_index: 0,
        }
    }
}

impl Default for ShellLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ShellLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        let read_to = src.len().min(self.max_length.saturating_add(1));
        let scan_from = self.next_index.min(read_to);
        if let Some(offset) = src[scan_from..read_to].iter().position(|b| *b == b'\n') {
            let newline = scan_from + offset;
            self.next_index = 0;
            let line = src.split_to(newline + 1);
            return Ok(Some(to_line(&line[..newline])));
        }

        if src.len() > self.max_length {
            self.next_index = 0;
            let chunk = src.split_to(self.max_length);
            return Ok(Some(to_line(&chunk)));
        }

        self.next_index = read_to;
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        self.next_index = 0;
        let rest = src.split_to(src.len());
        Ok(Some(to_line(&rest)))
    }
}

fn to_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut ShellLineCodec, input: &[u8]) -> Vec<String> {
        let mut buf = BytesMut::from(input);
        let mut lines = Vec::new();
        while let Some(line) = codec.decode(&mut buf).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_splits_on_newlines() {
        let mut codec = ShellLineCodec::new();
        assert_eq!(decode_all(&mut codec, b"one\ntwo\n"), vec!["one", "two"]);
    }

    #[test]
    fn test_keeps_empty_lines() {
        let mut codec = ShellLineCodec::new();
        assert_eq!(decode_all(&mut codec, b"a\n\nb\n"), vec!["a", "", "b"]);
    }

    #[test]
    fn test_strips_carriage_return() {
        let mut codec = ShellLineCodec::new();
        assert_eq!(decode_all(&mut codec, b"dos\r\n"), vec!["dos"]);
    }

    #[test]
    fn test_partial_line_waits_for_more_input() {
        let mut codec = ShellLineCodec::new();
        let mut buf = BytesMut::from(&b"partial"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b" line\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("partial line"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut codec = ShellLineCodec::new();
        let lines = decode_all(&mut codec, b"ok \xff\xfe end\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ok "));
        assert!(lines[0].ends_with(" end"));
        assert!(lines[0].contains('\u{FFFD}'));
    }

    #[test]
    fn test_overlong_line_is_chunked() {
        let mut codec = ShellLineCodec::with_max_length(4);
        assert_eq!(
            decode_all(&mut codec, b"abcdefghij\n"),
            vec!["abcd", "efgh", "ij"]
        );
    }

    #[test]
    fn test_eof_flushes_unterminated_line() {
        let mut codec = ShellLineCodec::new();
        let mut buf = BytesMut::from(&b"last words"[..]);
        assert_eq!(
            codec.decode_eof(&mut buf).unwrap().as_deref(),
            Some("last words")
        );
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_eof_on_empty_buffer() {
        let mut codec = ShellLineCodec::new();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }
}
