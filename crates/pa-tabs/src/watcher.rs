//! Tab watcher task.
//!
//! Applies tab lifecycle events to the ledger in arrival order. Delivery is
//! independent of in-flight decisions, so a block recorded just after a
//! navigation may land in the fresh records; the ledger is eventually
//! consistent with what the tab shows.

use crate::ledger::BlockLedger;
use crate::message::TabEvent;
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Spawn the watcher. It runs until every sender is dropped.
pub fn spawn_watcher(ledger: BlockLedger, mut rx: Receiver<TabEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Tab watcher started");
        while let Some(event) = rx.recv().await {
            apply_event(&ledger, event).await;
        }
        debug!("Tab event channel closed, watcher stopping");
    })
}

async fn apply_event(ledger: &BlockLedger, event: TabEvent) {
    let tab_id = event.tab_id();
    let result = match event {
        TabEvent::Updated { tab_id, url, tab_url } => ledger
            .handle_tab_updated(tab_id, url.as_deref(), &tab_url)
            .await
            .map(|_| ()),
        TabEvent::Removed { tab_id } => ledger.remove_tab(tab_id).await,
    };

    if let Err(e) = result {
        warn!("{} lifecycle bookkeeping failed: {}", tab_id, e);
    }
}
