//! Helpers for logging untrusted input.

/// Longest prefix of a logged line or chunk.
pub const LOG_PREVIEW_BYTES: usize = 200;

/// Truncate `s` to at most `max_bytes` without splitting a UTF-8 codepoint.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Shorten peer-provided text for a log line.
pub fn preview(s: &str) -> &str {
    truncate_str(s, LOG_PREVIEW_BYTES)
}
