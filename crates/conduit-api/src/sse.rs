//! Line framing for streamed replies.
//!
//! The body is a sequence of `data: <json>` lines terminated by
//! `data: [DONE]`. Network chunks split lines arbitrarily, including in the
//! middle of a multi-byte UTF-8 sequence, so bytes are buffered until a full
//! line is available and only then decoded.

/// What a single line of the body means.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DataLine {
    /// A payload to parse as a JSON chunk.
    Payload(String),
    /// The `[DONE]` terminator.
    Done,
}

/// Incremental line splitter over raw body bytes.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every line completed by them.
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            lines.push(decode_line(&self.buffer[start..end]));
            start = end + 1;
        }
        self.buffer.drain(..start);
        lines
    }

    /// The trailing line when the body ends without a newline.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = decode_line(&self.buffer);
        self.buffer.clear();
        Some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Classify one line. Anything that isn't a `data:` field (event names,
/// comments, blank separators) is ignored.
pub(crate) fn parse_line(line: &str) -> Option<DataLine> {
    let data = line.strip_prefix("data:")?;
    // A single leading space is part of the field syntax.
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data.trim() == "[DONE]" {
        return Some(DataLine::Done);
    }
    if data.trim().is_empty() {
        return None;
    }
    Some(DataLine::Payload(data.to_string()))
}
