//! Guard Configuration
//!
//! Loaded from TOML or JSON (picked by file extension). Every field has a
//! default, so an empty file is a valid configuration.
//!
//! ```toml
//! extension_origin = "moz-extension://port-authority"
//! tracker_suffixes = ["online-metrix.net"]
//!
//! [dns]
//! timeout_ms = 2000
//! use_system_dns = true
//! ```

use pa_network::{DnsConfig, TrackerPatterns};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Popup page path under the extension origin
pub const POPUP_PATH: &str = "/popup/popup.html";

/// Configuration errors
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid extension origin: {0}")]
    InvalidOrigin(String),

    #[error("DNS timeout must be between 1 ms and 60 s")]
    InvalidTimeout,

    #[error("Tab event buffer must be at least 1")]
    InvalidBuffer,
}

/// Resolver settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSettings {
    /// Upper bound for one canonical-name lookup
    pub timeout_ms: u64,
    /// Cache TTL for successful lookups
    pub cache_ttl_secs: u64,
    /// Cache TTL for failed lookups
    pub negative_cache_ttl_secs: u64,
    /// Maximum cached hosts
    pub max_cache_entries: usize,
    /// System resolver, or Cloudflare when false
    pub use_system_dns: bool,
}

impl Default for DnsSettings {
    fn default() -> Self {
        let dns = DnsConfig::default();
        Self {
            timeout_ms: dns.timeout.as_millis() as u64,
            cache_ttl_secs: dns.cache_ttl.as_secs(),
            negative_cache_ttl_secs: dns.negative_cache_ttl.as_secs(),
            max_cache_entries: dns.max_cache_entries,
            use_system_dns: dns.use_system_dns,
        }
    }
}

/// Everything the guard needs to start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Origin of the extension; the popup lives under it
    pub extension_origin: String,
    /// JSON storage file (platform data dir when unset)
    pub store_path: Option<PathBuf>,
    /// Canonical-name suffixes treated as tracking infrastructure
    pub tracker_suffixes: Vec<String>,
    /// Capacity of the tab event channel
    pub tab_event_buffer: usize,
    /// Resolver settings
    pub dns: DnsSettings,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            extension_origin: "moz-extension://port-authority".to_string(),
            store_path: None,
            tracker_suffixes: TrackerPatterns::default().suffixes().to_vec(),
            tab_event_buffer: 256,
            dns: DnsSettings::default(),
        }
    }
}

impl GuardConfig {
    /// Load from a `.toml` or `.json` file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let content = match ext {
            "toml" | "json" => {
                std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?
            }
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };

        let config = if ext == "toml" {
            Self::from_toml(&content)?
        } else {
            Self::from_json(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let origin = url::Url::parse(&self.extension_origin)
            .map_err(|e| ConfigError::InvalidOrigin(format!("{}: {}", self.extension_origin, e)))?;
        if origin.path() != "/" && !origin.path().is_empty() {
            return Err(ConfigError::InvalidOrigin(self.extension_origin.clone()));
        }
        if self.dns.timeout_ms == 0 || self.dns.timeout_ms > 60_000 {
            return Err(ConfigError::InvalidTimeout);
        }
        if self.tab_event_buffer == 0 {
            return Err(ConfigError::InvalidBuffer);
        }
        Ok(())
    }

    /// The only page allowed to send control commands
    pub fn trusted_popup_url(&self) -> String {
        format!("{}{}", self.extension_origin.trim_end_matches('/'), POPUP_PATH)
    }

    pub fn tracker_patterns(&self) -> TrackerPatterns {
        TrackerPatterns::new(&self.tracker_suffixes)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns.timeout_ms)
    }

    /// Resolver configuration for `HickoryLookup`
    pub fn dns_config(&self) -> DnsConfig {
        DnsConfig {
            cache_ttl: Duration::from_secs(self.dns.cache_ttl_secs),
            negative_cache_ttl: Duration::from_secs(self.dns.negative_cache_ttl_secs),
            max_cache_entries: self.dns.max_cache_entries,
            use_system_dns: self.dns.use_system_dns,
            timeout: self.dns_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = GuardConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.tracker_suffixes, vec!["online-metrix.net".to_string()]);
        assert_eq!(config.dns_timeout(), Duration::from_secs(2));
        assert_eq!(
            config.trusted_popup_url(),
            "moz-extension://port-authority/popup/popup.html"
        );
    }

    #[test]
    fn test_from_toml_with_defaults() {
        let config = GuardConfig::from_toml(
            r#"
            extension_origin = "moz-extension://abc-123/"
            tracker_suffixes = ["online-metrix.net", "tracker.example"]

            [dns]
            timeout_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.trusted_popup_url(), "moz-extension://abc-123/popup/popup.html");
        assert_eq!(config.dns_timeout(), Duration::from_millis(500));
        assert!(config.dns.use_system_dns);
        assert_eq!(config.tab_event_buffer, 256);
        assert!(config.tracker_patterns().matching_suffix("x.tracker.example").is_some());
    }

    #[test]
    fn test_from_json() {
        let config = GuardConfig::from_json(r#"{"store_path":"/tmp/pa.json"}"#).unwrap();
        assert_eq!(config.store_path, Some(PathBuf::from("/tmp/pa.json")));
        assert_eq!(config.extension_origin, GuardConfig::default().extension_origin);
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(GuardConfig::from_toml("").unwrap(), GuardConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = GuardConfig::default();
        config.dns.timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTimeout)));

        let mut config = GuardConfig::default();
        config.extension_origin = "not an origin".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidOrigin(_))));

        let mut config = GuardConfig::default();
        config.tab_event_buffer = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBuffer)));
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("guard.toml");
        std::fs::write(&toml_path, "tab_event_buffer = 8\n").unwrap();
        assert_eq!(GuardConfig::load(&toml_path).unwrap().tab_event_buffer, 8);

        let json_path = dir.path().join("guard.json");
        std::fs::write(&json_path, r#"{"tab_event_buffer": 16}"#).unwrap();
        assert_eq!(GuardConfig::load(&json_path).unwrap().tab_event_buffer, 16);

        let yaml_path = dir.path().join("guard.yaml");
        assert!(matches!(
            GuardConfig::load(&yaml_path),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = GuardConfig::default();
        assert_eq!(GuardConfig::from_toml(&config.to_toml()).unwrap(), config);
    }
}
