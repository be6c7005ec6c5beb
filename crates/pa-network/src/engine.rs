//! Decision Engine
//!
//! Runs once per intercepted request and returns allow or block. The steps
//! are strictly sequential; each one can end the decision:
//!
//! 1. Origin URL unparseable → allow (fail open)
//! 2. Origin host on the allow list → allow
//! 3. Target classified local or public
//! 4. Public target whose canonical name is a tracker → block
//! 5. Local target requested by a public page → block (port scan)
//! 6. Otherwise → allow
//!
//! Blocks are written to the ledger through [`BlockRecorder`]. Bookkeeping
//! failures are logged and never change the verdict.

use crate::allow_list::AllowList;
use crate::classifier::classify;
use crate::tracker::TrackerResolver;
use pa_storage::{NOTIFICATIONS_ALLOWED, Storage};
use pa_tabs::{BlockEvent, BlockRecorder, TabId};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};
use url::{Host, Url};

/// One intercepted request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    /// Request target
    pub url: String,
    /// Address-bar URL of the page making the request. Missing or `null`
    /// for top-level and browser-initiated requests, which reads as empty
    /// and fails to parse.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub origin_url: String,
    /// Tab the request belongs to
    pub tab_id: TabId,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl RequestContext {
    pub fn new(url: impl Into<String>, origin_url: impl Into<String>, tab_id: TabId) -> Self {
        Self {
            url: url.into(),
            origin_url: origin_url.into(),
            tab_id,
        }
    }
}

/// Wire verdict: `{ "allow": bool }`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub allow: bool,
}

impl Verdict {
    pub const ALLOW: Self = Self { allow: true };
    pub const BLOCK: Self = Self { allow: false };

    pub fn is_blocked(&self) -> bool {
        !self.allow
    }
}

/// Why a request was allowed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowReason {
    /// Origin URL could not be parsed
    UnparseableOrigin,
    /// Target URL could not be parsed
    UnparseableTarget,
    /// Allow list could not be read
    StorageUnavailable,
    /// Canonical-name lookup failed or timed out
    LookupFailed,
    /// Origin host is on the allow list
    Allowlisted,
    /// Local page talking to a local service
    LocalOrigin,
    /// Nothing matched
    NoMatch,
}

/// Why a request was blocked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// Public page reaching into the local network
    PortScan { host: String, port: Option<u16> },
    /// Canonical name belongs to tracking infrastructure
    TrackingCname { host: String, canonical: String },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PortScan { host, port: Some(port) } => write!(f, "Port scan: {}:{}", host, port),
            Self::PortScan { host, port: None } => write!(f, "Port scan: {}", host),
            Self::TrackingCname { host, canonical } => {
                write!(f, "Tracking CNAME: {} -> {}", host, canonical)
            }
        }
    }
}

/// Full outcome of a decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow(AllowReason),
    Block(BlockReason),
}

impl Decision {
    pub fn verdict(&self) -> Verdict {
        match self {
            Self::Allow(_) => Verdict::ALLOW,
            Self::Block(_) => Verdict::BLOCK,
        }
    }
}

impl From<&Decision> for Verdict {
    fn from(decision: &Decision) -> Self {
        decision.verdict()
    }
}

/// Decision statistics
#[derive(Debug, Default)]
pub struct EngineStats {
    pub total_requests: AtomicU64,
    pub blocked_port_scans: AtomicU64,
    pub blocked_trackers: AtomicU64,
    /// Requests allowed because something could not be evaluated
    pub failed_open: AtomicU64,
}

/// Allow/block decisions for intercepted requests
pub struct DecisionEngine {
    storage: Storage,
    tracker: TrackerResolver,
    recorder: Arc<dyn BlockRecorder>,
    stats: EngineStats,
}

impl DecisionEngine {
    /// `storage` supplies the allow list and settings; `recorder` receives
    /// block events.
    pub fn new(storage: Storage, tracker: TrackerResolver, recorder: Arc<dyn BlockRecorder>) -> Self {
        Self {
            storage,
            tracker,
            recorder,
            stats: EngineStats::default(),
        }
    }

    /// Decide a request.
    pub async fn decide(&self, ctx: &RequestContext) -> Verdict {
        self.evaluate(ctx).await.verdict()
    }

    /// Decide a request and report why.
    pub async fn evaluate(&self, ctx: &RequestContext) -> Decision {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        // Request logging rides on the notifications setting
        if self.storage.get_or(NOTIFICATIONS_ALLOWED, false).await.unwrap_or(false) {
            debug!("Request details: {:?}", ctx);
        }

        let origin = match Url::parse(&ctx.origin_url) {
            Ok(url) => url,
            Err(e) => {
                warn!("Unparseable origin '{}', not filtering: {}", ctx.origin_url, e);
                return self.fail_open(AllowReason::UnparseableOrigin);
            }
        };

        match AllowList::load(&self.storage).await {
            Ok(list) if list.allows(&origin) => {
                debug!("Origin {} is allow-listed", origin);
                return Decision::Allow(AllowReason::Allowlisted);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Allow list unavailable, not filtering: {}", e);
                return self.fail_open(AllowReason::StorageUnavailable);
            }
        }

        let target = match Url::parse(&ctx.url) {
            Ok(url) => url,
            Err(e) => {
                warn!("Unparseable request URL '{}', not filtering: {}", ctx.url, e);
                return self.fail_open(AllowReason::UnparseableTarget);
            }
        };

        // Local targets never get a DNS lookup
        if !classify(&target).is_local() {
            if let Some(host) = lookup_host(&target) {
                match self.tracker.check(host).await {
                    Ok(Some(canonical)) => {
                        info!("Blocking {} for tracker CNAME {}", host, canonical);
                        self.stats.blocked_trackers.fetch_add(1, Ordering::Relaxed);
                        self.record(BlockEvent::Tracker {
                            tab_id: ctx.tab_id,
                            host: host.to_string(),
                            origin_url: ctx.origin_url.clone(),
                        })
                        .await;
                        return Decision::Block(BlockReason::TrackingCname {
                            host: host.to_string(),
                            canonical,
                        });
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Tracker check skipped: {}", e);
                        return self.fail_open(AllowReason::LookupFailed);
                    }
                }
            }
            return Decision::Allow(AllowReason::NoMatch);
        }

        if classify(&origin).is_local() {
            return Decision::Allow(AllowReason::LocalOrigin);
        }

        let host = target.host_str().unwrap_or_default().to_string();
        let port = target.port_or_known_default();
        info!("Blocking port scan of {} from {}", target, origin);
        self.stats.blocked_port_scans.fetch_add(1, Ordering::Relaxed);
        self.record(BlockEvent::PortScan {
            tab_id: ctx.tab_id,
            host: host.clone(),
            port,
            origin_url: ctx.origin_url.clone(),
        })
        .await;

        Decision::Block(BlockReason::PortScan { host, port })
    }

    /// `(total, port scans blocked, trackers blocked, failed open)`
    pub fn stats(&self) -> (u64, u64, u64, u64) {
        (
            self.stats.total_requests.load(Ordering::Relaxed),
            self.stats.blocked_port_scans.load(Ordering::Relaxed),
            self.stats.blocked_trackers.load(Ordering::Relaxed),
            self.stats.failed_open.load(Ordering::Relaxed),
        )
    }

    fn fail_open(&self, reason: AllowReason) -> Decision {
        self.stats.failed_open.fetch_add(1, Ordering::Relaxed);
        Decision::Allow(reason)
    }

    async fn record(&self, event: BlockEvent) {
        let tab_id = event.tab_id();
        if let Err(e) = self.recorder.record(event).await {
            warn!("Bookkeeping for {} failed: {}", tab_id, e);
        }
    }
}

/// Host name to resolve. IP literals have no canonical name to check.
fn lookup_host(url: &Url) -> Option<&str> {
    match url.host()? {
        Host::Domain(domain) => Some(domain),
        Host::Ipv4(_) | Host::Ipv6(_) => None,
    }
}
