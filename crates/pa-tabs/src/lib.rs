//! Port Authority Tabs
//!
//! Per-tab bookkeeping for blocked requests:
//! - Block ledger (badge counters, blocked ports, blocked tracker hosts)
//! - Tab lifecycle events that reset or destroy a tab's records
//! - Queued recorder that writes blocks off the decision path
//! - Watcher task that applies lifecycle events as they arrive

mod ledger;
mod message;
mod recorder;
mod watcher;

pub use ledger::{Badge, BlockEvent, BlockLedger, BlockRecorder, BlockedHosts, BlockedPorts};
pub use message::{TabEvent, TabId};
pub use recorder::QueuedRecorder;
pub use watcher::spawn_watcher;
