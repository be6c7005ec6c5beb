//! Queued block recorder.
//!
//! Decisions hand block events to a channel and return immediately; a single
//! writer task drains the channel into the ledger in arrival order.

use crate::ledger::{BlockEvent, BlockLedger, BlockRecorder};
use async_trait::async_trait;
use pa_storage::StorageError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

enum Job {
    Record(BlockEvent),
    Flush(oneshot::Sender<()>),
}

/// Non-blocking [`BlockRecorder`] backed by a writer task
#[derive(Clone)]
pub struct QueuedRecorder {
    tx: mpsc::UnboundedSender<Job>,
}

impl QueuedRecorder {
    /// Spawn the writer task for `ledger`. The task stops once every clone of
    /// the recorder is dropped.
    pub fn spawn(ledger: BlockLedger) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Record(event) => {
                        let tab_id = event.tab_id();
                        if let Err(e) = ledger.record(event).await {
                            warn!("Bookkeeping for {} failed: {}", tab_id, e);
                        }
                    }
                    Job::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Block recorder stopping");
        });

        (Self { tx }, handle)
    }

    /// Wait until every event queued before this call is written.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Job::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

#[async_trait]
impl BlockRecorder for QueuedRecorder {
    async fn record(&self, event: BlockEvent) -> Result<(), StorageError> {
        self.tx
            .send(Job::Record(event))
            .map_err(|_| StorageError::Unavailable("block recorder stopped".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TabId;
    use pa_storage::Storage;

    fn tracker(host: &str) -> BlockEvent {
        BlockEvent::Tracker {
            tab_id: TabId(3),
            host: host.to_string(),
            origin_url: "https://bank.example/".to_string(),
        }
    }

    #[tokio::test]
    async fn test_flush_waits_for_writes() {
        let ledger = BlockLedger::new(Storage::in_memory());
        let (recorder, _handle) = QueuedRecorder::spawn(ledger.clone());

        for host in ["a.bank.example", "b.bank.example", "a.bank.example"] {
            recorder.record(tracker(host)).await.unwrap();
        }
        recorder.flush().await;

        let hosts = ledger.blocked_hosts(TabId(3)).await.unwrap().unwrap();
        assert_eq!(hosts, vec!["a.bank.example".to_string(), "b.bank.example".to_string()]);
        assert_eq!(ledger.badge(TabId(3)).await.unwrap().unwrap().counter, 3);
    }

    #[tokio::test]
    async fn test_record_after_stop_fails() {
        let ledger = BlockLedger::new(Storage::in_memory());
        let (recorder, handle) = QueuedRecorder::spawn(ledger);
        handle.abort();
        let _ = handle.await;

        assert!(recorder.record(tracker("a.example")).await.is_err());
        // Flush on a stopped recorder returns instead of hanging
        recorder.flush().await;
    }
}
