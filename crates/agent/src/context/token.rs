//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token, rounded up.
//! Close enough for BPE tokenizers on English text and fully deterministic,
//! which keeps budget enforcement predictable.

/// Estimate the token count for a string.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.len().div_ceil(4)
}

/// Truncate `text` at a word boundary so it fits in `max_tokens`.
///
/// An ellipsis marks the cut. Returns the text unchanged when it already
/// fits, and an empty string when not even one word fits.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    if estimate_tokens(text) <= max_tokens {
        return text.to_string();
    }
    const MARKER: &str = " …";
    let max_bytes = (max_tokens * 4).saturating_sub(MARKER.len());

    let mut end = 0;
    for (idx, ch) in text.char_indices() {
        if idx + ch.len_utf8() > max_bytes {
            break;
        }
        if ch.is_whitespace() {
            end = idx;
        }
    }
    let kept = text[..end].trim_end();
    if kept.is_empty() {
        return String::new();
    }
    format!("{kept}{MARKER}")
}
