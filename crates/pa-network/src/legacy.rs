//! Legacy host pattern.
//!
//! The anchored expression that used to be the only local-address check.
//! It is only consulted for URLs that parse but carry no network host, where
//! the structured classifier has nothing to look at. Since it requires a
//! hosted scheme and a host, it does not match any such URL.

use regex::Regex;
use std::sync::LazyLock;

const LEGACY_HOST_PATTERN: &str = concat!(
    r"(?i)\b^(?:http|https|wss|ws|ftp|ftps)://(?:",
    r"127\.(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)",
    r"\.(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)",
    r"\.(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)",
    r"|0\.0\.0\.0",
    r"|10(?:\.(?:25[0-5]|2[0-4][0-9]|1[0-9]{1,2}|[0-9]{1,2})){3}",
    r"|localhost",
    r"|172\.(?:0?1[6-9]|0?2[0-9]|0?3[01])",
    r"\.(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)",
    r"\.(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)",
    r"|192\.168",
    r"\.(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)",
    r"\.(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)",
    r"|169\.254",
    r"\.(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)",
    r"\.(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)",
    r")(?:/(?:[789]|1?[0-9]{2}))?\b",
);

static LEGACY_HOST_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(LEGACY_HOST_PATTERN).expect("legacy host pattern is valid"));

/// Bounded regex fallback for host-less URLs
pub struct LegacyPattern;

impl LegacyPattern {
    /// Test a serialized URL against the legacy expression.
    pub fn matches(url: &str) -> bool {
        LEGACY_HOST_REGEX.is_match(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_local_literals() {
        assert!(LegacyPattern::matches("http://127.0.0.1/"));
        assert!(LegacyPattern::matches("https://192.168.1.20:8443/admin"));
        assert!(LegacyPattern::matches("ws://10.1.2.3"));
        assert!(LegacyPattern::matches("ftp://172.20.0.5"));
        assert!(LegacyPattern::matches("http://169.254.169.254/latest"));
        assert!(LegacyPattern::matches("HTTP://LOCALHOST:631"));
        assert!(LegacyPattern::matches("http://0.0.0.0:8080"));
    }

    #[test]
    fn test_rejects_public_and_hostless() {
        assert!(!LegacyPattern::matches("https://8.8.8.8/"));
        assert!(!LegacyPattern::matches("https://172.32.0.1/"));
        assert!(!LegacyPattern::matches("https://example.com/127.0.0.1"));
        assert!(!LegacyPattern::matches("about:blank"));
        assert!(!LegacyPattern::matches("data:text/plain,localhost"));
        assert!(!LegacyPattern::matches("http://localhostile.example/"));
    }
}
