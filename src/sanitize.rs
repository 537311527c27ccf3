use once_cell::sync::Lazy;
use regex::Regex;

// Anything outside printable ASCII, which covers CR/LF and other control bytes.
static UNPRINTABLE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^ -~]").unwrap());

/// Render a client-supplied value (usually an idempotency key) safe for a
/// log line: control and non-ASCII characters removed, wrapped in brackets.
pub fn sanitize_key(input: &str) -> String {
    if input.is_empty() {
        return "[empty]".to_string();
    }
    format!("[{}]", UNPRINTABLE_REGEX.replace_all(input, ""))
}
