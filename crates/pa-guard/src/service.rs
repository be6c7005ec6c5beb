//! Guard Service
//!
//! Coordinates storage, the decision engine, the blocking switch, tab
//! bookkeeping and the control plane into one handle for the host.
//!
//! # Usage
//!
//! ```rust,ignore
//! let guard = Guard::open(GuardConfig::default()).await?;
//!
//! // Request hook
//! let verdict = guard.on_before_request(&ctx).await;
//!
//! // Tab hook
//! guard.tab_event(TabEvent::Removed { tab_id }).await;
//!
//! // Popup messages
//! let response = guard.command(envelope).await;
//!
//! guard.shutdown().await;
//! ```

use crate::config::{ConfigError, GuardConfig};
use crate::control::{ControlError, ControlPlane, Envelope, Response};
use crate::switch::{BlockingState, BlockingSwitch, InterceptionPipeline};
use pa_network::{
    CanonicalNameLookup, DecisionEngine, HickoryLookup, RequestContext, TrackerResolver, Verdict,
};
use pa_storage::{JsonFileStore, Storage, StorageError};
use pa_tabs::{BlockLedger, QueuedRecorder, TabEvent, spawn_watcher};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Guard errors
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Running guard
pub struct Guard {
    /// Configuration
    config: GuardConfig,
    /// Persisted settings and bookkeeping
    storage: Storage,
    /// Per-tab records
    ledger: BlockLedger,
    /// Engine shared with the pipeline
    engine: Arc<DecisionEngine>,
    /// Request hook
    pipeline: Arc<InterceptionPipeline>,
    /// Blocking on/off
    switch: BlockingSwitch,
    /// Popup commands
    control: ControlPlane,
    /// Block writer
    recorder: QueuedRecorder,
    recorder_task: JoinHandle<()>,
    /// Tab lifecycle events
    tab_tx: mpsc::Sender<TabEvent>,
    watcher_task: JoinHandle<()>,
}

impl Guard {
    /// Start with the configured JSON store and the hickory resolver.
    pub async fn open(config: GuardConfig) -> Result<Self, GuardError> {
        config.validate()?;

        let store = match &config.store_path {
            Some(path) => JsonFileStore::open(path).await?,
            None => JsonFileStore::open_default().await?,
        };
        info!("Using store {}", store.path().display());

        let lookup = HickoryLookup::new(config.dns_config());
        Ok(Self::start(config, Storage::new(Arc::new(store)), Arc::new(lookup)).await)
    }

    /// Wire the components and apply the persisted blocking flag. Must be
    /// called inside a tokio runtime.
    pub async fn start(
        config: GuardConfig,
        storage: Storage,
        lookup: Arc<dyn CanonicalNameLookup>,
    ) -> Self {
        let ledger = BlockLedger::new(storage.clone());
        let (recorder, recorder_task) = QueuedRecorder::spawn(ledger.clone());

        let tracker = TrackerResolver::new(lookup, config.tracker_patterns(), config.dns_timeout());
        let engine = Arc::new(DecisionEngine::new(
            storage.clone(),
            tracker,
            Arc::new(recorder.clone()),
        ));

        let pipeline = Arc::new(InterceptionPipeline::new());
        let switch = BlockingSwitch::new(storage.clone(), pipeline.clone(), engine.clone());
        let control = ControlPlane::new(config.trusted_popup_url(), storage.clone(), switch.clone());

        let (tab_tx, tab_rx) = mpsc::channel(config.tab_event_buffer);
        let watcher_task = spawn_watcher(ledger.clone(), tab_rx);

        let state = switch.startup().await;
        info!("Port Authority started (blocking {:?})", state);

        Self {
            config,
            storage,
            ledger,
            engine,
            pipeline,
            switch,
            control,
            recorder,
            recorder_task,
            tab_tx,
            watcher_task,
        }
    }

    /// Verdict for an intercepted request
    pub async fn on_before_request(&self, ctx: &RequestContext) -> Verdict {
        self.pipeline.dispatch(ctx).await
    }

    /// Verdict for a request that the browser may abandon; `None` once
    /// `abort` fires.
    pub async fn on_before_request_abortable(
        &self,
        ctx: &RequestContext,
        abort: oneshot::Receiver<()>,
    ) -> Option<Verdict> {
        self.pipeline.dispatch_abortable(ctx, abort).await
    }

    /// Queue a tab lifecycle event for the watcher.
    pub async fn tab_event(&self, event: TabEvent) {
        if self.tab_tx.send(event).await.is_err() {
            warn!("Tab watcher stopped, event dropped");
        }
    }

    /// Handle a popup command.
    pub async fn command(&self, envelope: Envelope) -> Result<Response, ControlError> {
        self.control.dispatch(envelope).await
    }

    pub fn state(&self) -> BlockingState {
        self.switch.state()
    }

    pub fn switch(&self) -> &BlockingSwitch {
        &self.switch
    }

    pub fn ledger(&self) -> &BlockLedger {
        &self.ledger
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// `(total, port scans blocked, trackers blocked, failed open)`
    pub fn stats(&self) -> (u64, u64, u64, u64) {
        self.engine.stats()
    }

    /// Wait until every block recorded so far is written.
    pub async fn flush(&self) {
        self.recorder.flush().await;
    }

    /// Drain pending bookkeeping and stop the background tasks.
    pub async fn shutdown(self) {
        let Self {
            recorder,
            recorder_task,
            tab_tx,
            watcher_task,
            ..
        } = self;

        drop(tab_tx);
        if let Err(e) = watcher_task.await {
            warn!("Tab watcher ended abnormally: {}", e);
        }

        recorder.flush().await;
        recorder_task.abort();
        debug!("Port Authority stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Command;
    use pa_network::StaticLookup;
    use pa_storage::{ALLOWED_DOMAIN_LIST, BLOCKING_ENABLED};
    use pa_tabs::TabId;

    const POPUP: &str = "moz-extension://port-authority/popup/popup.html";

    async fn guard(storage: Storage) -> Guard {
        let lookup = StaticLookup::new().with_alias("content.bank.example", "h.online-metrix.net");
        Guard::start(GuardConfig::default(), storage, Arc::new(lookup)).await
    }

    fn scan(tab: i64) -> RequestContext {
        RequestContext::new("http://127.0.0.1:8080/", "https://shop.example/", TabId(tab))
    }

    #[tokio::test]
    async fn test_blocks_after_startup() {
        let guard = guard(Storage::in_memory()).await;
        assert_eq!(guard.state(), BlockingState::Enabled);

        assert_eq!(guard.on_before_request(&scan(1)).await, Verdict::BLOCK);
        guard.flush().await;

        let ports = guard.ledger().blocked_ports(TabId(1)).await.unwrap().unwrap();
        assert_eq!(ports.get("127.0.0.1"), Some(&vec![8080]));
        assert_eq!(guard.stats().1, 1);
    }

    #[tokio::test]
    async fn test_disabled_at_startup_allows() {
        let storage = Storage::in_memory();
        storage.set(BLOCKING_ENABLED, &false).await.unwrap();

        let guard = guard(storage).await;
        assert_eq!(guard.state(), BlockingState::Disabled);
        assert_eq!(guard.on_before_request(&scan(1)).await, Verdict::ALLOW);
    }

    #[tokio::test]
    async fn test_popup_toggle_round_trip() {
        let guard = guard(Storage::in_memory()).await;

        guard
            .command(Envelope::new(POPUP, Command::ToggleEnabled { value: false }))
            .await
            .unwrap();
        assert_eq!(guard.on_before_request(&scan(1)).await, Verdict::ALLOW);

        guard
            .command(Envelope::new(POPUP, Command::ToggleEnabled { value: true }))
            .await
            .unwrap();
        assert_eq!(guard.on_before_request(&scan(1)).await, Verdict::BLOCK);
    }

    #[tokio::test]
    async fn test_allow_list_via_popup() {
        let guard = guard(Storage::in_memory()).await;

        guard
            .command(Envelope::new(
                POPUP,
                Command::SetItemInLocal {
                    key: ALLOWED_DOMAIN_LIST.to_string(),
                    value: serde_json::json!(["shop.example"]),
                },
            ))
            .await
            .unwrap();
        assert_eq!(guard.on_before_request(&scan(1)).await, Verdict::ALLOW);
    }

    #[tokio::test]
    async fn test_tab_events_clear_records() {
        let storage = Storage::in_memory();
        let guard = guard(storage.clone()).await;

        guard.on_before_request(&scan(1)).await;
        guard.on_before_request(&scan(2)).await;
        let tracker = RequestContext::new(
            "https://content.bank.example/fp.js",
            "https://bank.example/",
            TabId(2),
        );
        assert_eq!(guard.on_before_request(&tracker).await, Verdict::BLOCK);
        guard.flush().await;

        guard
            .tab_event(TabEvent::Updated {
                tab_id: TabId(1),
                url: Some("https://elsewhere.example/".to_string()),
                tab_url: "https://elsewhere.example/".to_string(),
            })
            .await;
        guard.tab_event(TabEvent::Removed { tab_id: TabId(2) }).await;

        let ledger = BlockLedger::new(storage);
        guard.shutdown().await;

        let badge = ledger.badge(TabId(1)).await.unwrap().unwrap();
        assert_eq!(badge.counter, 0);
        assert_eq!(badge.last_url, "https://elsewhere.example/");
        assert!(ledger.blocked_ports(TabId(1)).await.unwrap().is_none());
        assert!(ledger.badge(TabId(2)).await.unwrap().is_none());
        assert!(ledger.blocked_hosts(TabId(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_with_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        let config = GuardConfig {
            store_path: Some(path.clone()),
            ..GuardConfig::default()
        };

        let guard = Guard::open(config.clone()).await.unwrap();
        assert_eq!(guard.state(), BlockingState::Enabled);
        // Local target, so no DNS traffic
        assert_eq!(guard.on_before_request(&scan(4)).await, Verdict::BLOCK);
        guard
            .command(Envelope::new(POPUP, Command::ToggleEnabled { value: false }))
            .await
            .unwrap();
        guard.shutdown().await;

        let stored: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(stored["blocking_enabled"], serde_json::json!(false));
        assert_eq!(stored["blocked_ports"]["4"]["127.0.0.1"], serde_json::json!([8080]));

        // Reopening picks the persisted flag back up
        let reopened = Guard::open(config).await.unwrap();
        assert_eq!(reopened.state(), BlockingState::Disabled);
        reopened.shutdown().await;
    }
}
