//! Line framing (spec.md §4.4, §4.6, design note "Line framing helper").
//!
//! Every component that turns a byte stream into IRC lines (the upstream
//! `IrcConnection`, each downstream `IrcProxyClient`) repeats the same
//! buffer drain: append bytes, split on `\n`, hand back every complete
//! line, keep the trailing partial fragment buffered. `FrameSink`
//! centralizes that so the drain logic is written and tested once.

use bytes::BytesMut;

/// Accumulates raw bytes and yields whole, newline-terminated lines.
///
/// Successive newlines collapse (an empty line between two `\n\n` never
/// surfaces as a blank line to the caller), `\r` immediately before `\n`
/// is stripped, and the final, possibly-empty fragment after the last
/// `\n` is retained for the next `ingest` call.
#[derive(Default)]
pub struct FrameSink {
    buffer: BytesMut,
}

impl FrameSink {
    pub fn new() -> Self {
        FrameSink {
            buffer: BytesMut::new(),
        }
    }

    /// Appends `bytes` to the internal buffer and drains every complete
    /// line out of it, in arrival order.
    pub fn ingest(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        loop {
            let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                break;
            };

            let line_bytes = self.buffer.split_to(newline_pos + 1);
            let line = &line_bytes[..line_bytes.len() - 1];
            let line = line.strip_suffix(b"\r").unwrap_or(line);

            if !line.is_empty() {
                lines.push(String::from_utf8_lossy(line).into_owned());
            }
        }

        lines
    }

    #[cfg(test)]
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_complete_lines_and_keeps_partial() {
        let mut sink = FrameSink::new();
        let lines = sink.ingest(b"PING :1\r\nJOIN #chan\r\nPART #c");
        assert_eq!(lines, vec!["PING :1", "JOIN #chan"]);
        assert_eq!(sink.pending(), b"PART #c");
    }

    #[test]
    fn completes_partial_line_across_calls() {
        let mut sink = FrameSink::new();
        assert!(sink.ingest(b"PART #c").is_empty());
        let lines = sink.ingest(b"han\r\n");
        assert_eq!(lines, vec!["PART #chan"]);
    }

    #[test]
    fn collapses_successive_newlines() {
        let mut sink = FrameSink::new();
        let lines = sink.ingest(b"A\n\n\nB\n");
        assert_eq!(lines, vec!["A", "B"]);
    }

    #[test]
    fn tolerates_bare_lf_without_cr() {
        let mut sink = FrameSink::new();
        let lines = sink.ingest(b"PING :x\n");
        assert_eq!(lines, vec!["PING :x"]);
    }
}
