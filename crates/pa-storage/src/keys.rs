//! Persisted key names.
//!
//! These match the keys the popup reads, so they stay stable across versions.

/// `bool`: whether the request listener should be attached at startup.
pub const BLOCKING_ENABLED: &str = "blocking_enabled";

/// `Vec<String>`: hosts exempt from blocking (exact match).
pub const ALLOWED_DOMAIN_LIST: &str = "allowed_domain_list";

/// `bool`: notification toggle, also enables per-request debug logging.
pub const NOTIFICATIONS_ALLOWED: &str = "notificationsAllowed";

/// `map<tab, map<host, list<port>>>`
pub const BLOCKED_PORTS: &str = "blocked_ports";

/// `map<tab, list<host>>`
pub const BLOCKED_HOSTS: &str = "blocked_hosts";

/// `map<tab, {counter, alerted, lastURL}>`
pub const BADGES: &str = "badges";
