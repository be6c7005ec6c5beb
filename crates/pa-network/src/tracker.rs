//! Tracker Resolver
//!
//! Detects requests to first-party-looking hosts whose DNS canonical name
//! points at tracking infrastructure (for example a `content.bank.example`
//! CNAME to `*.online-metrix.net`).
//!
//! Provides:
//! - `CanonicalNameLookup` seam with a hickory-resolver implementation
//! - Positive/negative caching of canonical names
//! - Bounded lookups: a lookup that outlives the timeout is a non-match

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::RData;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Canonical-name suffix of the ThreatMetrix fingerprinting service
pub const THREATMETRIX_SUFFIX: &str = "online-metrix.net";

/// Canonical-name resolution errors
#[derive(Debug, Clone, Error)]
pub enum TrackerError {
    #[error("Canonical-name lookup for {host} timed out after {timeout:?}")]
    Timeout { host: String, timeout: Duration },

    #[error("Resolution failed for {host}: {reason}")]
    ResolutionFailed { host: String, reason: String },
}

/// Resolver configuration
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Cache TTL for successful lookups
    pub cache_ttl: Duration,
    /// Cache TTL for failed lookups
    pub negative_cache_ttl: Duration,
    /// Maximum cache size
    pub max_cache_entries: usize,
    /// Whether to use system DNS or Cloudflare
    pub use_system_dns: bool,
    /// Upper bound for a single lookup
    pub timeout: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            negative_cache_ttl: Duration::from_secs(60),
            max_cache_entries: 10000,
            use_system_dns: true,
            timeout: Duration::from_secs(2),
        }
    }
}

/// Something that can answer "what name does this host ultimately alias?"
#[async_trait]
pub trait CanonicalNameLookup: Send + Sync {
    /// Canonical name for `host`. A host without CNAME records is its own
    /// canonical name.
    async fn canonical_name(&self, host: &str) -> Result<String, TrackerError>;
}

/// Cached lookup result
#[derive(Clone)]
struct CacheEntry {
    /// `None` records a failed lookup
    canonical: Option<String>,
    expires_at: Instant,
}

/// hickory-resolver backed lookup with caching
pub struct HickoryLookup {
    resolver: TokioAsyncResolver,
    cache: RwLock<HashMap<String, CacheEntry>>,
    config: DnsConfig,
}

impl HickoryLookup {
    /// Create a resolver from system configuration (or Cloudflare).
    ///
    /// An unreadable system configuration falls back to Cloudflare, so
    /// construction never fails.
    pub fn new(config: DnsConfig) -> Self {
        let mut opts = ResolverOpts::default();
        let resolver_config = if config.use_system_dns {
            match hickory_resolver::system_conf::read_system_conf() {
                Ok((system_config, system_opts)) => {
                    opts = system_opts;
                    system_config
                }
                Err(e) => {
                    warn!("System DNS configuration unavailable, using Cloudflare: {}", e);
                    ResolverConfig::cloudflare()
                }
            }
        } else {
            ResolverConfig::cloudflare()
        };
        opts.timeout = config.timeout;

        let resolver = TokioAsyncResolver::tokio(resolver_config, opts);
        info!("Canonical-name resolver initialized");

        Self {
            resolver,
            cache: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(DnsConfig::default())
    }

    /// Clear all cached entries
    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
        info!("Canonical-name cache cleared");
    }

    /// `(total, still valid)` cache entries
    pub async fn cache_stats(&self) -> (usize, usize) {
        let cache = self.cache.read().await;
        let now = Instant::now();
        let valid = cache.values().filter(|e| e.expires_at > now).count();
        (cache.len(), valid)
    }

    async fn get_cached(&self, host: &str) -> Option<Option<String>> {
        let cache = self.cache.read().await;
        cache
            .get(host)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.canonical.clone())
    }

    async fn cache_result(&self, host: &str, canonical: Option<String>) {
        let mut cache = self.cache.write().await;

        if cache.len() >= self.config.max_cache_entries {
            let now = Instant::now();
            cache.retain(|_, v| v.expires_at > now);

            if cache.len() >= self.config.max_cache_entries {
                let keys_to_remove: Vec<_> = cache.keys().take(cache.len() / 4).cloned().collect();
                for key in keys_to_remove {
                    cache.remove(&key);
                }
            }
        }

        let ttl = if canonical.is_some() {
            self.config.cache_ttl
        } else {
            self.config.negative_cache_ttl
        };
        cache.insert(
            host.to_string(),
            CacheEntry {
                canonical,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

#[async_trait]
impl CanonicalNameLookup for HickoryLookup {
    async fn canonical_name(&self, host: &str) -> Result<String, TrackerError> {
        let normalized = host.to_ascii_lowercase();

        if let Some(cached) = self.get_cached(&normalized).await {
            debug!("Canonical-name cache hit for: {}", host);
            return cached.ok_or_else(|| TrackerError::ResolutionFailed {
                host: host.to_string(),
                reason: "cached failure".to_string(),
            });
        }

        debug!("Canonical-name lookup for: {}", host);
        let lookup = match self.resolver.lookup_ip(normalized.as_str()).await {
            Ok(lookup) => lookup,
            Err(e) => {
                self.cache_result(&normalized, None).await;
                return Err(TrackerError::ResolutionFailed {
                    host: host.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        // The last CNAME in the answer chain is the name the host aliases
        let canonical = lookup
            .as_lookup()
            .records()
            .iter()
            .filter_map(|record| match record.data() {
                Some(RData::CNAME(target)) => Some(target.0.to_utf8()),
                _ => None,
            })
            .last()
            .map(|name| name.trim_end_matches('.').to_string())
            .unwrap_or_else(|| normalized.clone());

        self.cache_result(&normalized, Some(canonical.clone())).await;
        Ok(canonical)
    }
}

/// Fixed alias table.
///
/// Hosts missing from the table are their own canonical name. Hosts listed
/// as failing return a resolution error.
#[derive(Debug, Default)]
pub struct StaticLookup {
    aliases: HashMap<String, String>,
    failing: Vec<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `host -> canonical` alias
    pub fn with_alias(mut self, host: &str, canonical: &str) -> Self {
        self.aliases.insert(host.to_ascii_lowercase(), canonical.to_string());
        self
    }

    /// Make lookups of `host` fail
    pub fn with_failure(mut self, host: &str) -> Self {
        self.failing.push(host.to_ascii_lowercase());
        self
    }

    /// Delay every answer (simulates a slow resolver)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of lookups performed
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CanonicalNameLookup for StaticLookup {
    async fn canonical_name(&self, host: &str) -> Result<String, TrackerError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let normalized = host.to_ascii_lowercase();
        if self.failing.contains(&normalized) {
            return Err(TrackerError::ResolutionFailed {
                host: host.to_string(),
                reason: "no such host".to_string(),
            });
        }
        Ok(self.aliases.get(&normalized).cloned().unwrap_or(normalized))
    }
}

/// Canonical-name suffixes that identify tracking infrastructure
#[derive(Debug, Clone)]
pub struct TrackerPatterns {
    suffixes: Vec<String>,
}

impl TrackerPatterns {
    /// Build from suffixes. Matching is case-insensitive.
    pub fn new<I, S>(suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let suffixes = suffixes
            .into_iter()
            .map(|s| s.as_ref().trim_end_matches('.').to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self { suffixes }
    }

    /// The suffix `canonical` ends with, if any.
    pub fn matching_suffix(&self, canonical: &str) -> Option<&str> {
        let canonical = canonical.trim_end_matches('.').to_ascii_lowercase();
        self.suffixes
            .iter()
            .find(|suffix| canonical.ends_with(suffix.as_str()))
            .map(String::as_str)
    }

    pub fn suffixes(&self) -> &[String] {
        &self.suffixes
    }
}

impl Default for TrackerPatterns {
    fn default() -> Self {
        Self::new([THREATMETRIX_SUFFIX])
    }
}

/// Canonical-name lookup plus tracker matching, bounded by a timeout
#[derive(Clone)]
pub struct TrackerResolver {
    lookup: Arc<dyn CanonicalNameLookup>,
    patterns: TrackerPatterns,
    timeout: Duration,
}

impl TrackerResolver {
    pub fn new(lookup: Arc<dyn CanonicalNameLookup>, patterns: TrackerPatterns, timeout: Duration) -> Self {
        Self {
            lookup,
            patterns,
            timeout,
        }
    }

    /// Resolve the canonical name of `host` within the timeout.
    pub async fn resolve(&self, host: &str) -> Result<String, TrackerError> {
        match tokio::time::timeout(self.timeout, self.lookup.canonical_name(host)).await {
            Ok(result) => result,
            Err(_) => Err(TrackerError::Timeout {
                host: host.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    /// `Some(canonical)` when the host aliases tracking infrastructure.
    pub async fn check(&self, host: &str) -> Result<Option<String>, TrackerError> {
        let canonical = self.resolve(host).await?;
        match self.patterns.matching_suffix(&canonical) {
            Some(suffix) => {
                debug!("{} aliases {} (matches {})", host, canonical, suffix);
                Ok(Some(canonical))
            }
            None => Ok(None),
        }
    }

    pub fn patterns(&self) -> &TrackerPatterns {
        &self.patterns
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
