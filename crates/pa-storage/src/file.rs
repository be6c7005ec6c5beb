//! JSON File Store
//!
//! Keeps every key in one JSON object on disk. The whole object is cached in
//! memory; each write re-serializes it and replaces the file atomically
//! (write to a sibling temp file, then rename) so a crash mid-write never
//! leaves a half-written store behind.

use crate::store::{KeyValueStore, StorageError};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// File name used under the data directory
const STORE_FILE_NAME: &str = "storage.json";

/// Directory name under the platform data directory
const APP_DIR_NAME: &str = "port-authority";

/// Disk-backed [`KeyValueStore`]
pub struct JsonFileStore {
    path: PathBuf,
    entries: RwLock<Map<String, Value>>,
}

impl JsonFileStore {
    /// Open (or create) a store at `path`.
    ///
    /// A missing file is treated as an empty store. A file that exists but
    /// does not hold a JSON object is reported as corrupt.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();

        let entries = match fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => Map::new(),
            Ok(content) => match serde_json::from_str::<Value>(&content) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    return Err(StorageError::Corrupt {
                        path: path.display().to_string(),
                        reason: "top-level value is not an object".to_string(),
                    });
                }
                Err(e) => {
                    return Err(StorageError::Corrupt {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    });
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No store at {}, starting empty", path.display());
                Map::new()
            }
            Err(e) => return Err(e.into()),
        };

        info!("Storage opened at {} ({} keys)", path.display(), entries.len());

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Open the store at the platform default location.
    pub async fn open_default() -> Result<Self, StorageError> {
        Self::open(Self::default_path()).await
    }

    /// `<data dir>/port-authority/storage.json`, or the working directory
    /// when the platform has no data directory.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR_NAME)
            .join(STORE_FILE_NAME)
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, entries: &Map<String, Value>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_vec_pretty(entries).map_err(|e| StorageError::Serialization {
            key: "*".to_string(),
            reason: e.to_string(),
        })?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, json).await?;
        if let Err(e) = fs::rename(&temp_path, &self.path).await {
            warn!("Failed to replace {}: {}", self.path.display(), e);
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn load(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn store(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let mut entries = self.entries.write().await;
        let previous = entries.insert(key.to_string(), value);

        if let Err(e) = self.persist(&entries).await {
            // Keep memory and disk in step
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.write().await;
        if let Some(old) = entries.remove(key) {
            if let Err(e) = self.persist(&entries).await {
                entries.insert(key.to_string(), old);
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    /// Store path one directory below a fresh temp dir, so the first write
    /// also has to create the parent.
    fn scratch_path() -> (TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("port-authority").join(STORE_FILE_NAME);
        (dir, path)
    }

    #[tokio::test]
    async fn test_missing_file_opens_empty() {
        let (_dir, path) = scratch_path();
        let store = JsonFileStore::open(&path).await.unwrap();
        assert!(store.load("blocking_enabled").await.unwrap().is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let (_dir, path) = scratch_path();

        let store = JsonFileStore::open(&path).await.unwrap();
        store.store("blocking_enabled", Value::from(false)).await.unwrap();
        store
            .store("allowed_domain_list", serde_json::json!(["example.com"]))
            .await
            .unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.load("blocking_enabled").await.unwrap(),
            Some(Value::from(false))
        );
        assert_eq!(
            reopened.load("allowed_domain_list").await.unwrap(),
            Some(serde_json::json!(["example.com"]))
        );

        reopened.remove("blocking_enabled").await.unwrap();
        let again = JsonFileStore::open(&path).await.unwrap();
        assert!(again.load("blocking_enabled").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let (_dir, path) = scratch_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[1, 2, 3]").unwrap();

        let result = JsonFileStore::open(&path).await;
        assert!(matches!(result, Err(StorageError::Corrupt { .. })));
    }

    #[test]
    fn test_default_path_ends_with_store_file() {
        let path = JsonFileStore::default_path();
        assert!(path.ends_with("port-authority/storage.json"));
    }
}
