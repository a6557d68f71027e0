//! Small shared helpers used across the gateway.

use sha2::{Digest, Sha256};

/// Truncate a string to at most `max_chars` characters, appending "..." if
/// truncated. Safe on multi-byte UTF-8 (uses character boundaries, not byte
/// indices). Used when quoting client input in logs.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", s[..idx].trim_end()),
        None => s.to_string(),
    }
}

/// Hard-truncate to `max_chars` characters with no marker. Used for bounded
/// metric label values, where an ellipsis would create extra label
/// cardinality between runs.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Short non-reversible fingerprint of a secret, safe to log. Never log the
/// secret itself.
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex::encode(&digest[..6])
}

/// Current unix time in whole seconds.
pub fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
