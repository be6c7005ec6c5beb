//! Storage seam and typed access.

use crate::memory::MemoryStore;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::trace;

/// Errors surfaced by a storage backend
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error for '{key}': {reason}")]
    Serialization { key: String, reason: String },

    #[error("Corrupt store at {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Raw key/value backend.
///
/// Values are JSON so the same backend can hold flags, lists and nested
/// per-tab maps without a schema.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a key. `Ok(None)` means the key was never written.
    async fn load(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Write a key, replacing any previous value.
    async fn store(&self, key: &str, value: Value) -> Result<(), StorageError>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Typed handle over a [`KeyValueStore`].
///
/// Cloning is cheap and every clone shares the same write lock, which is the
/// single serialization point for all writes in the process.
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn KeyValueStore>,
    write_lock: Arc<Mutex<()>>,
}

impl Storage {
    /// Wrap a backend
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Storage backed by a fresh [`MemoryStore`]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Read a raw value, falling back to `default` when the key is unset.
    pub async fn get_raw(&self, key: &str, default: Value) -> Result<Value, StorageError> {
        Ok(self.backend.load(key).await?.unwrap_or(default))
    }

    /// Write a raw value.
    pub async fn set_raw(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        trace!("storage set {}", key);
        self.backend.store(key, value).await
    }

    /// Read a typed value, falling back to `default` when the key is unset.
    pub async fn get_or<T>(&self, key: &str, default: T) -> Result<T, StorageError>
    where
        T: DeserializeOwned,
    {
        match self.backend.load(key).await? {
            Some(value) => decode(key, value),
            None => Ok(default),
        }
    }

    /// Write a typed value.
    pub async fn set<T>(&self, key: &str, value: &T) -> Result<(), StorageError>
    where
        T: Serialize + Sync,
    {
        let encoded = encode(key, value)?;
        self.set_raw(key, encoded).await
    }

    /// Read-modify-write under the write lock.
    ///
    /// The closure sees the current value (or `default`) and mutates it in
    /// place; the result is written back and returned.
    pub async fn modify<T, F>(&self, key: &str, default: T, f: F) -> Result<T, StorageError>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce(&mut T) + Send,
    {
        let _guard = self.write_lock.lock().await;

        let mut current = match self.backend.load(key).await? {
            Some(value) => decode(key, value)?,
            None => default,
        };
        f(&mut current);

        let encoded = encode(key, &current)?;
        trace!("storage modify {}", key);
        self.backend.store(key, encoded).await?;
        Ok(current)
    }

    /// Delete a key.
    pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        self.backend.remove(key).await
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, StorageError> {
    serde_json::from_value(value).map_err(|e| StorageError::Serialization {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn encode<T: Serialize + ?Sized>(key: &str, value: &T) -> Result<Value, StorageError> {
    serde_json::to_value(value).map_err(|e| StorageError::Serialization {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
