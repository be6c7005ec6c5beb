//! Blocking Switch
//!
//! Turns request filtering on and off.
//!
//! # Behavior
//!
//! - `Enabled`: the decision engine is attached to the request pipeline and
//!   every intercepted request gets a verdict
//! - `Disabled`: nothing is attached and every request proceeds
//!
//! The attachment is the live state. The persisted `blocking_enabled` flag
//! mirrors it so the choice survives a restart; if the two ever disagree the
//! attachment wins and the mismatch is logged.

use pa_network::{DecisionEngine, RequestContext, Verdict};
use pa_storage::{BLOCKING_ENABLED, Storage};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Blocking state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingState {
    /// Requests are filtered
    Enabled,
    /// Requests pass untouched
    Disabled,
}

impl BlockingState {
    pub fn from_flag(enabled: bool) -> Self {
        if enabled { Self::Enabled } else { Self::Disabled }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, BlockingState::Enabled)
    }
}

/// Persisted flag and live attachment disagree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("State mismatch: stored blocking_enabled={stored}, listener attached={attached}")]
pub struct StateMismatch {
    pub stored: bool,
    pub attached: bool,
}

/// The interception hook a decision engine plugs into
pub trait RequestPipeline: Send + Sync {
    /// Attach the engine. Returns false when one was already attached.
    fn attach(&self, engine: Arc<DecisionEngine>) -> bool;

    /// Detach the engine. Returns false when nothing was attached.
    fn detach(&self) -> bool;

    fn is_attached(&self) -> bool;
}

/// In-process request pipeline with at most one listener
#[derive(Default)]
pub struct InterceptionPipeline {
    listener: RwLock<Option<Arc<DecisionEngine>>>,
}

impl InterceptionPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    fn listener(&self) -> Option<Arc<DecisionEngine>> {
        self.listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run a request through the attached engine. Without a listener the
    /// request proceeds.
    pub async fn dispatch(&self, ctx: &RequestContext) -> Verdict {
        match self.listener() {
            Some(engine) => engine.decide(ctx).await,
            None => Verdict::ALLOW,
        }
    }

    /// Like [`dispatch`](Self::dispatch), but gives up when `abort` fires.
    /// An aborted request is owed no verdict; dropping the sender without
    /// firing does not abort.
    pub async fn dispatch_abortable(
        &self,
        ctx: &RequestContext,
        abort: oneshot::Receiver<()>,
    ) -> Option<Verdict> {
        tokio::select! {
            verdict = self.dispatch(ctx) => Some(verdict),
            Ok(()) = abort => {
                debug!("Request to {} aborted before a verdict", ctx.url);
                None
            }
        }
    }
}

impl RequestPipeline for InterceptionPipeline {
    fn attach(&self, engine: Arc<DecisionEngine>) -> bool {
        let mut listener = self.listener.write().unwrap_or_else(PoisonError::into_inner);
        if listener.is_some() {
            return false;
        }
        *listener = Some(engine);
        true
    }

    fn detach(&self) -> bool {
        self.listener
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    fn is_attached(&self) -> bool {
        self.listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Blocking switch controller
///
/// # Usage
///
/// ```rust,ignore
/// let switch = BlockingSwitch::new(storage, pipeline, engine);
/// switch.startup().await;     // state from the persisted flag
///
/// switch.disable().await;     // detach, persist false
/// switch.enable().await;      // attach, persist true
/// assert!(switch.is_listening().await);
/// ```
#[derive(Clone)]
pub struct BlockingSwitch {
    storage: Storage,
    pipeline: Arc<dyn RequestPipeline>,
    engine: Arc<DecisionEngine>,
}

impl BlockingSwitch {
    pub fn new(storage: Storage, pipeline: Arc<dyn RequestPipeline>, engine: Arc<DecisionEngine>) -> Self {
        Self {
            storage,
            pipeline,
            engine,
        }
    }

    /// Apply the persisted flag (default enabled).
    pub async fn startup(&self) -> BlockingState {
        let enabled = match self.storage.get_or(BLOCKING_ENABLED, true).await {
            Ok(enabled) => enabled,
            Err(e) => {
                warn!("Could not read {}, blocking by default: {}", BLOCKING_ENABLED, e);
                true
            }
        };
        self.set_enabled(enabled).await
    }

    /// Attach the engine and persist `true`.
    pub async fn enable(&self) -> BlockingState {
        if self.pipeline.attach(self.engine.clone()) {
            info!("Blocking enabled");
        } else {
            debug!("Blocking already enabled");
        }
        self.persist(true).await;
        self.state()
    }

    /// Detach the engine and persist `false`.
    pub async fn disable(&self) -> BlockingState {
        if self.pipeline.detach() {
            info!("Blocking disabled");
        } else {
            debug!("Blocking already disabled");
        }
        self.persist(false).await;
        self.state()
    }

    pub async fn set_enabled(&self, enabled: bool) -> BlockingState {
        if enabled {
            self.enable().await
        } else {
            self.disable().await
        }
    }

    /// Live state, from the attachment alone
    pub fn state(&self) -> BlockingState {
        BlockingState::from_flag(self.pipeline.is_attached())
    }

    /// Compare the persisted flag with the attachment.
    pub async fn check_consistency(&self) -> Result<(), StateMismatch> {
        let attached = self.pipeline.is_attached();
        let stored = match self.storage.get_or(BLOCKING_ENABLED, true).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Could not read {}: {}", BLOCKING_ENABLED, e);
                return Ok(());
            }
        };

        if stored == attached {
            Ok(())
        } else {
            Err(StateMismatch { stored, attached })
        }
    }

    /// Whether requests are being filtered. A mismatch with the persisted
    /// flag is logged; the attachment decides.
    pub async fn is_listening(&self) -> bool {
        if let Err(mismatch) = self.check_consistency().await {
            error!("{}", mismatch);
        }
        self.pipeline.is_attached()
    }

    /// Write the flag only when it differs from what is stored.
    async fn persist(&self, enabled: bool) {
        match self.storage.get_or(BLOCKING_ENABLED, !enabled).await {
            Ok(stored) if stored == enabled => {}
            _ => {
                if let Err(e) = self.storage.set(BLOCKING_ENABLED, &enabled).await {
                    warn!("Could not persist {}={}: {}", BLOCKING_ENABLED, enabled, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pa_network::{StaticLookup, TrackerPatterns, TrackerResolver};
    use pa_storage::MemoryStore;
    use pa_tabs::{BlockLedger, TabId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn engine(storage: &Storage, lookup: StaticLookup) -> Arc<DecisionEngine> {
        let tracker = TrackerResolver::new(
            Arc::new(lookup),
            TrackerPatterns::default(),
            Duration::from_secs(2),
        );
        Arc::new(DecisionEngine::new(
            storage.clone(),
            tracker,
            Arc::new(BlockLedger::new(storage.clone())),
        ))
    }

    /// Counts attach/detach calls on top of the real pipeline
    #[derive(Default)]
    struct RecordingPipeline {
        inner: InterceptionPipeline,
        attaches: AtomicUsize,
        detaches: AtomicUsize,
    }

    impl RequestPipeline for RecordingPipeline {
        fn attach(&self, engine: Arc<DecisionEngine>) -> bool {
            self.attaches.fetch_add(1, Ordering::Relaxed);
            self.inner.attach(engine)
        }

        fn detach(&self) -> bool {
            self.detaches.fetch_add(1, Ordering::Relaxed);
            self.inner.detach()
        }

        fn is_attached(&self) -> bool {
            self.inner.is_attached()
        }
    }

    struct Fixture {
        switch: BlockingSwitch,
        storage: Storage,
        store: Arc<MemoryStore>,
        pipeline: Arc<RecordingPipeline>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let storage = Storage::new(store.clone());
        let pipeline = Arc::new(RecordingPipeline::default());
        let switch = BlockingSwitch::new(
            storage.clone(),
            pipeline.clone(),
            engine(&storage, StaticLookup::new()),
        );
        Fixture {
            switch,
            storage,
            store,
            pipeline,
        }
    }

    #[tokio::test]
    async fn test_startup_defaults_to_enabled() {
        let f = fixture();

        assert_eq!(f.switch.startup().await, BlockingState::Enabled);
        assert!(f.pipeline.is_attached());
        assert!(f.storage.get_or(BLOCKING_ENABLED, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_startup_respects_stored_flag() {
        let f = fixture();
        f.storage.set(BLOCKING_ENABLED, &false).await.unwrap();

        assert_eq!(f.switch.startup().await, BlockingState::Disabled);
        assert!(!f.pipeline.is_attached());
    }

    #[tokio::test]
    async fn test_enable_twice_keeps_one_listener_and_one_write() {
        let f = fixture();

        f.switch.enable().await;
        let writes = f.store.write_count();
        f.switch.enable().await;

        assert!(f.pipeline.is_attached());
        assert!(!f.pipeline.inner.attach(engine(&f.storage, StaticLookup::new())));
        assert_eq!(f.store.write_count(), writes);
    }

    #[tokio::test]
    async fn test_disable_detaches_and_persists() {
        let f = fixture();
        f.switch.enable().await;

        assert_eq!(f.switch.disable().await, BlockingState::Disabled);
        assert!(!f.pipeline.is_attached());
        assert!(!f.storage.get_or(BLOCKING_ENABLED, true).await.unwrap());

        let writes = f.store.write_count();
        f.switch.disable().await;
        assert_eq!(f.store.write_count(), writes);
        assert_eq!(f.pipeline.detaches.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_mismatch_reports_attachment() {
        let f = fixture();
        f.switch.enable().await;

        // Someone else flips the stored flag
        f.storage.set(BLOCKING_ENABLED, &false).await.unwrap();

        assert_eq!(
            f.switch.check_consistency().await,
            Err(StateMismatch {
                stored: false,
                attached: true,
            })
        );
        assert!(f.switch.is_listening().await);
    }

    #[tokio::test]
    async fn test_disabled_pipeline_allows_everything() {
        let pipeline = InterceptionPipeline::new();
        let ctx = RequestContext::new("http://127.0.0.1:22/", "https://evil.example/", TabId(1));

        assert_eq!(pipeline.dispatch(&ctx).await, Verdict::ALLOW);

        let storage = Storage::in_memory();
        pipeline.attach(engine(&storage, StaticLookup::new()));
        assert_eq!(pipeline.dispatch(&ctx).await, Verdict::BLOCK);

        pipeline.detach();
        assert_eq!(pipeline.dispatch(&ctx).await, Verdict::ALLOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_yields_no_verdict() {
        let storage = Storage::in_memory();
        let pipeline = InterceptionPipeline::new();
        pipeline.attach(engine(
            &storage,
            StaticLookup::new().with_delay(Duration::from_secs(1)),
        ));
        let ctx = RequestContext::new("https://slow.example/", "https://a.example/", TabId(1));

        let (abort_tx, abort_rx) = oneshot::channel();
        abort_tx.send(()).unwrap();
        assert_eq!(pipeline.dispatch_abortable(&ctx, abort_rx).await, None);

        // A dropped sender is not an abort
        let (abort_tx, abort_rx) = oneshot::channel::<()>();
        drop(abort_tx);
        assert_eq!(
            pipeline.dispatch_abortable(&ctx, abort_rx).await,
            Some(Verdict::ALLOW)
        );
    }
}
