//! Port Authority Storage
//!
//! Key/value persistence for everything the extension remembers between
//! restarts: the blocking switch, the allow list, notification settings and
//! the per-tab block ledger.
//!
//! Layout:
//! 1. `KeyValueStore` is the raw backend seam (JSON values by key)
//! 2. `Storage` adds typed get/set/modify on top of any backend
//! 3. Read-modify-write goes through a single write lock so concurrent
//!    modifications of the same key never lose updates

mod file;
mod keys;
mod memory;
mod store;

pub use file::JsonFileStore;
pub use keys::{
    ALLOWED_DOMAIN_LIST, BADGES, BLOCKED_HOSTS, BLOCKED_PORTS, BLOCKING_ENABLED,
    NOTIFICATIONS_ALLOWED,
};
pub use memory::MemoryStore;
pub use store::{KeyValueStore, Storage, StorageError};
