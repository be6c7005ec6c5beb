//! Host Classifier
//!
//! Decides whether a URL points at the local machine or the private network.
//! The check is a pure function of the parsed URL: no DNS, no I/O.
//!
//! Rules, first match wins:
//! 1. `file:` URLs are local (there is no network host to protect)
//! 2. URLs without a host fall back to the legacy pattern. That pattern
//!    requires a network scheme followed by a host, and every URL with such
//!    a scheme parses with a host, so the fallback never matches in
//!    practice: `about:`, `data:`, `blob:` and friends come out public.
//! 3. Special-use names: `*.localhost`, `*.local`, `*.internal`, `*.home.arpa`
//! 4. IPv4 literals (or their `in-addr.arpa` reverse names) in loopback,
//!    link-local, mDNS or RFC 1918 space
//! 5. Everything else is public
//!
//! Host normalization (IDNA, percent-decoding, `0x7f000001`-style IPv4
//! forms) is left to the `url` crate. A label that is not a plain decimal
//! number is never treated as an address octet, so `127.0.0.1.example.com`
//! stays public.
//!
//! IPv6 literals are classified public; unique-local and link-local IPv6
//! ranges are not covered by this version.

use crate::legacy::LegacyPattern;
use std::fmt;
use thiserror::Error;
use tracing::trace;
use url::Url;

/// Suffix of IPv4 reverse-lookup names
const REVERSE_ZONE_SUFFIX: &str = ".in-addr.arpa";

/// Suffix reserved for home networks (RFC 8375)
const HOME_ARPA_SUFFIX: &str = ".home.arpa";

/// Top labels reserved for loopback, mDNS and private use
const SPECIAL_USE_TOP_LABELS: [&str; 3] = ["localhost", "local", "internal"];

/// Classification errors
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("Unparseable URL '{input}': {reason}")]
    UnparseableUrl { input: String, reason: String },
}

/// Why a host counts as local. Kept for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalReason {
    /// `file:` URL
    FileScheme,
    /// 127.0.0.0/8 or 0.0.0.0/8
    Loopback,
    /// 169.254.0.0/16 or the mDNS group 224.0.0.251
    LinkLocal,
    /// 10/8, 172.16/12, 192.168/16
    PrivateRange,
    /// `localhost`, `local`, `internal` or `home.arpa` name
    SpecialUseName,
    /// `in-addr.arpa` name of a local address
    ReverseZone,
    /// Host-less URL matched by the legacy pattern. Not produced for any
    /// URL the `url` crate parses, since the pattern needs a host.
    LegacyPattern,
}

impl fmt::Display for LocalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FileScheme => "file-scheme",
            Self::Loopback => "loopback",
            Self::LinkLocal => "link-local",
            Self::PrivateRange => "private-range",
            Self::SpecialUseName => "special-use-name",
            Self::ReverseZone => "reverse-zone",
            Self::LegacyPattern => "legacy-pattern",
        };
        f.write_str(name)
    }
}

/// Result of classifying a URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationVerdict {
    Local(LocalReason),
    Public,
}

impl ClassificationVerdict {
    /// Whether the target is on the local machine or private network
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// Diagnostic reason, if local
    pub fn reason(&self) -> Option<LocalReason> {
        match self {
            Self::Local(reason) => Some(*reason),
            Self::Public => None,
        }
    }
}

impl fmt::Display for ClassificationVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(reason) => write!(f, "local ({})", reason),
            Self::Public => f.write_str("public"),
        }
    }
}

/// Classify a parsed URL.
pub fn classify(url: &Url) -> ClassificationVerdict {
    if url.scheme() == "file" {
        return ClassificationVerdict::Local(LocalReason::FileScheme);
    }

    let Some(host) = url.host_str() else {
        return if LegacyPattern::matches(url.as_str()) {
            trace!("Legacy pattern matched host-less URL: {}", url);
            ClassificationVerdict::Local(LocalReason::LegacyPattern)
        } else {
            ClassificationVerdict::Public
        };
    };

    let verdict = classify_host(host);
    trace!("Classified {} as {}", host, verdict);
    verdict
}

/// Parse then classify. Parse failures are the caller's to handle.
pub fn classify_str(input: &str) -> Result<ClassificationVerdict, ClassifyError> {
    let url = Url::parse(input).map_err(|e| ClassifyError::UnparseableUrl {
        input: input.to_string(),
        reason: e.to_string(),
    })?;
    Ok(classify(&url))
}

/// Classify a bare host string (name or literal, as found in `Url::host_str`).
fn classify_host(host: &str) -> ClassificationVerdict {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let labels: Vec<&str> = host.split('.').collect();
    let top_label = labels.last().copied().unwrap_or_default();

    if SPECIAL_USE_TOP_LABELS.contains(&top_label) || host.ends_with(HOME_ARPA_SUFFIX) {
        return ClassificationVerdict::Local(LocalReason::SpecialUseName);
    }

    let reverse_zone = host.ends_with(REVERSE_ZONE_SUFFIX);
    let octets = if reverse_zone {
        // The zone lists octets least-significant first
        let mut address_labels = labels[..labels.len() - 2].to_vec();
        address_labels.reverse();
        parse_ipv4_labels(&address_labels)
    } else {
        parse_ipv4_labels(&labels)
    };

    match octets.and_then(local_ipv4_reason) {
        Some(_) if reverse_zone => ClassificationVerdict::Local(LocalReason::ReverseZone),
        Some(reason) => ClassificationVerdict::Local(reason),
        None => ClassificationVerdict::Public,
    }
}

/// Exactly four labels, each a plain decimal number in 0..=255.
fn parse_ipv4_labels(labels: &[&str]) -> Option<[u8; 4]> {
    if labels.len() != 4 {
        return None;
    }

    let mut octets = [0u8; 4];
    for (octet, label) in octets.iter_mut().zip(labels) {
        if label.is_empty() || !label.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        *octet = label.parse().ok()?;
    }
    Some(octets)
}

/// Local range an address falls in, if any.
fn local_ipv4_reason([a, b, c, d]: [u8; 4]) -> Option<LocalReason> {
    match (a, b, c, d) {
        (127, ..) | (0, ..) => Some(LocalReason::Loopback),
        (169, 254, ..) | (224, 0, 0, 251) => Some(LocalReason::LinkLocal),
        (10, ..) => Some(LocalReason::PrivateRange),
        (172, 16..=31, ..) => Some(LocalReason::PrivateRange),
        (192, 168, ..) => Some(LocalReason::PrivateRange),
        _ => None,
    }
}
