//! Subject validation and wildcard matching
//!
//! Subjects are dot-separated tokens (`mavlink.heartbeat`). Subscriptions may use
//! `*` to match exactly one token and `>` as the last token to match one or more
//! remaining tokens.

/// Single-token wildcard
pub const WILDCARD_ONE: &str = "*";

/// Trailing multi-token wildcard
pub const WILDCARD_TAIL: &str = ">";

/// Check that a subject is well formed.
///
/// Publish subjects must be literal; subscription subjects may contain wildcards.
pub fn is_valid(subject: &str, allow_wildcards: bool) -> bool {
    if subject.is_empty() {
        return false;
    }

    let tokens: Vec<&str> = subject.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() || token.chars().any(|c| c.is_whitespace()) {
            return false;
        }

        let is_last = i == tokens.len() - 1;
        match *token {
            WILDCARD_ONE if !allow_wildcards => return false,
            WILDCARD_TAIL if !allow_wildcards || !is_last => return false,
            t if t.len() > 1 && (t.contains('*') || t.contains('>')) => return false,
            _ => {}
        }
    }

    true
}

/// Check whether a literal subject matches a (possibly wildcarded) pattern
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(WILDCARD_TAIL), Some(_)) => return true,
            (Some(WILDCARD_ONE), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
