//! Small shared helpers: wall-clock timestamps and string sanitizing.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in seconds.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current Unix timestamp in microseconds.
pub fn current_time_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

const SAFE_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789 .,;-_/:?@()";

/// Strip a remote-supplied string down to a safe character set before it can
/// reach a log line or user interface. Anything outside the allowed set is
/// dropped, not escaped.
pub fn sanitize_string(input: &str) -> String {
    input.chars().filter(|c| SAFE_CHARS.contains(*c)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_control_characters() {
        assert_eq!(sanitize_string("/Ember:0.4.0/\n\x07"), "/Ember:0.4.0/");
        assert_eq!(sanitize_string("ok <script>"), "ok script");
    }

    #[test]
    fn test_sanitize_keeps_typical_user_agent() {
        let ua = "/Ember:0.4.0(EB32; AD12)/";
        assert_eq!(sanitize_string(ua), ua);
    }
}
