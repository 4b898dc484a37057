/// Output longer than this many characters is cut down to its head and tail.
pub const MAX_OUTPUT_CHARS: usize = 20_000;
/// Characters kept from each end of oversized output.
pub const KEEP_CHARS: usize = 10_000;
pub const TRUNCATION_MARKER: &str = "\n... (truncated) ...\n";

/// First `max` characters of `s`, never splitting a code point.
pub fn prefix_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Last `max` characters of `s`, never splitting a code point.
pub fn suffix_chars(s: &str, max: usize) -> &str {
    if max == 0 {
        return "";
    }
    match s.char_indices().rev().nth(max - 1) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Keep the head and tail of output over [`MAX_OUTPUT_CHARS`] characters.
pub fn truncate_output(output: &str) -> String {
    head_tail(output, MAX_OUTPUT_CHARS, KEEP_CHARS)
}

pub fn head_tail(output: &str, limit: usize, keep: usize) -> String {
    if output.chars().count() <= limit {
        return output.to_string();
    }
    format!(
        "{}{TRUNCATION_MARKER}{}",
        prefix_chars(output, keep),
        suffix_chars(output, keep)
    )
}
