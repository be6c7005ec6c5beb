//! Block Ledger
//!
//! Persists what was blocked in each tab so the popup can show it:
//! - `badges`: per-tab counter of blocks plus how many of them alerted
//! - `blocked_ports`: hosts a page tried to scan, with the ports it tried
//! - `blocked_hosts`: hosts whose canonical name pointed at a tracker
//!
//! Every mutation is a read-modify-write through [`Storage::modify`], which
//! serializes all bookkeeping writes behind one lock.

use crate::message::TabId;
use async_trait::async_trait;
use pa_storage::{BADGES, BLOCKED_HOSTS, BLOCKED_PORTS, Storage, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// `host -> ports` for one tab
pub type HostPorts = BTreeMap<String, Vec<u16>>;

/// `tab -> host -> ports`
pub type BlockedPorts = BTreeMap<TabId, HostPorts>;

/// `tab -> hosts`
pub type BlockedHosts = BTreeMap<TabId, Vec<String>>;

/// `tab -> badge`
pub type Badges = BTreeMap<TabId, Badge>;

/// Per-tab badge state shown on the toolbar icon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Badge {
    /// Blocks of any kind since the tab last navigated
    pub counter: u32,
    /// Blocks that raised an alert (tracker matches)
    pub alerted: u32,
    /// Page URL the counters belong to
    #[serde(rename = "lastURL")]
    pub last_url: String,
}

/// A block that needs to be written down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockEvent {
    /// A public page tried to reach a local address
    PortScan {
        tab_id: TabId,
        host: String,
        /// `None` when neither the URL nor its scheme names a port
        port: Option<u16>,
        /// Address-bar URL of the offending page
        origin_url: String,
    },
    /// The request's canonical name matched tracking infrastructure
    Tracker {
        tab_id: TabId,
        host: String,
        origin_url: String,
    },
}

impl BlockEvent {
    pub fn tab_id(&self) -> TabId {
        match self {
            Self::PortScan { tab_id, .. } | Self::Tracker { tab_id, .. } => *tab_id,
        }
    }

    /// Tracker matches alert; port scans only count.
    pub fn is_alert(&self) -> bool {
        matches!(self, Self::Tracker { .. })
    }
}

/// Sink for block events.
///
/// The decision engine only appends through this seam and never reads back.
#[async_trait]
pub trait BlockRecorder: Send + Sync {
    async fn record(&self, event: BlockEvent) -> Result<(), StorageError>;
}

/// Storage-backed ledger of blocked requests.
#[derive(Clone)]
pub struct BlockLedger {
    storage: Storage,
}

impl BlockLedger {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Bump the tab's badge. Alerts also bump `alerted`.
    pub async fn increase_badge(
        &self,
        tab_id: TabId,
        page_url: &str,
        alert: bool,
    ) -> Result<Badge, StorageError> {
        let badges = self
            .storage
            .modify(BADGES, Badges::new(), |badges| {
                let badge = badges.entry(tab_id).or_default();
                badge.counter += 1;
                if alert {
                    badge.alerted += 1;
                }
                badge.last_url = page_url.to_string();
            })
            .await?;

        Ok(badges.get(&tab_id).cloned().unwrap_or_default())
    }

    /// Remember that `host` was blocked on `port` for this tab.
    pub async fn add_blocked_port(
        &self,
        tab_id: TabId,
        host: &str,
        port: Option<u16>,
    ) -> Result<(), StorageError> {
        self.storage
            .modify(BLOCKED_PORTS, BlockedPorts::new(), |all| {
                let ports = all.entry(tab_id).or_default().entry(host.to_string()).or_default();
                if let Some(port) = port {
                    if !ports.contains(&port) {
                        ports.push(port);
                    }
                }
            })
            .await?;
        debug!("{} blocked port {:?} on {}", tab_id, port, host);
        Ok(())
    }

    /// Remember that `host` was blocked as a tracker for this tab.
    pub async fn add_blocked_host(&self, tab_id: TabId, host: &str) -> Result<(), StorageError> {
        self.storage
            .modify(BLOCKED_HOSTS, BlockedHosts::new(), |all| {
                let hosts = all.entry(tab_id).or_default();
                if !hosts.iter().any(|h| h == host) {
                    hosts.push(host.to_string());
                }
            })
            .await?;
        debug!("{} blocked tracking host {}", tab_id, host);
        Ok(())
    }

    /// Ports blocked in a tab, grouped by host.
    pub async fn blocked_ports(&self, tab_id: TabId) -> Result<Option<HostPorts>, StorageError> {
        let mut all: BlockedPorts = self.storage.get_or(BLOCKED_PORTS, BlockedPorts::new()).await?;
        Ok(all.remove(&tab_id))
    }

    /// Tracker hosts blocked in a tab.
    pub async fn blocked_hosts(&self, tab_id: TabId) -> Result<Option<Vec<String>>, StorageError> {
        let mut all: BlockedHosts = self.storage.get_or(BLOCKED_HOSTS, BlockedHosts::new()).await?;
        Ok(all.remove(&tab_id))
    }

    /// Current badge for a tab.
    pub async fn badge(&self, tab_id: TabId) -> Result<Option<Badge>, StorageError> {
        let mut all: Badges = self.storage.get_or(BADGES, Badges::new()).await?;
        Ok(all.remove(&tab_id))
    }

    /// Handle a tab update.
    ///
    /// When the update carries a URL different from the one the badge was
    /// counted for, the badge restarts at zero for `tab_url` and the tab's
    /// blocked ports and hosts are dropped. Returns whether anything reset.
    pub async fn handle_tab_updated(
        &self,
        tab_id: TabId,
        url: Option<&str>,
        tab_url: &str,
    ) -> Result<bool, StorageError> {
        let Some(url) = url else {
            return Ok(false);
        };

        let badges: Badges = self.storage.get_or(BADGES, Badges::new()).await?;
        let changed = match badges.get(&tab_id) {
            Some(badge) => badge.last_url != url,
            None => true,
        };
        if !changed {
            return Ok(false);
        }

        if badges.contains_key(&tab_id) {
            self.storage
                .modify(BADGES, Badges::new(), |badges| {
                    badges.insert(
                        tab_id,
                        Badge {
                            counter: 0,
                            alerted: 0,
                            last_url: tab_url.to_string(),
                        },
                    );
                })
                .await?;
        }
        self.clear_records(tab_id).await?;

        debug!("{} navigated to {}, ledger cleared", tab_id, url);
        Ok(true)
    }

    /// Destroy everything recorded for a closed tab.
    pub async fn remove_tab(&self, tab_id: TabId) -> Result<(), StorageError> {
        self.storage
            .modify(BADGES, Badges::new(), |badges| {
                badges.remove(&tab_id);
            })
            .await?;
        self.clear_records(tab_id).await?;

        info!("{} closed, ledger entries removed", tab_id);
        Ok(())
    }

    async fn clear_records(&self, tab_id: TabId) -> Result<(), StorageError> {
        self.storage
            .modify(BLOCKED_PORTS, BlockedPorts::new(), |all| {
                all.remove(&tab_id);
            })
            .await?;
        self.storage
            .modify(BLOCKED_HOSTS, BlockedHosts::new(), |all| {
                all.remove(&tab_id);
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BlockRecorder for BlockLedger {
    async fn record(&self, event: BlockEvent) -> Result<(), StorageError> {
        match &event {
            BlockEvent::PortScan {
                tab_id,
                host,
                port,
                origin_url,
            } => {
                self.increase_badge(*tab_id, origin_url, false).await?;
                self.add_blocked_port(*tab_id, host, *port).await
            }
            BlockEvent::Tracker {
                tab_id,
                host,
                origin_url,
            } => {
                self.increase_badge(*tab_id, origin_url, true).await?;
                self.add_blocked_host(*tab_id, host).await
            }
        }
    }
}
