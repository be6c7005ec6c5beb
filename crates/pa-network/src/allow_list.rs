//! User allow list.
//!
//! Hosts the user exempted from blocking. Matching is exact on the host
//! name only: `example.com` does not cover `www.example.com`, and scheme and
//! port never matter.

use pa_storage::{ALLOWED_DOMAIN_LIST, Storage, StorageError};
use std::collections::HashSet;
use url::Url;

/// Snapshot of the allow list
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    hosts: HashSet<String>,
}

impl AllowList {
    /// Build from explicit entries. Blank entries are ignored.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let hosts = entries
            .into_iter()
            .map(Into::into)
            .filter(|host: &String| !host.trim().is_empty())
            .collect();
        Self { hosts }
    }

    /// Read the current list from storage (empty when never set).
    pub async fn load(storage: &Storage) -> Result<Self, StorageError> {
        let entries: Vec<String> = storage.get_or(ALLOWED_DOMAIN_LIST, Vec::new()).await?;
        Ok(Self::from_entries(entries))
    }

    /// Exact host match
    pub fn contains(&self, host: &str) -> bool {
        self.hosts.contains(host)
    }

    /// Whether the URL's host is allowed
    pub fn allows(&self, url: &Url) -> bool {
        url.host_str().is_some_and(|host| self.contains(host))
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_only() {
        let list = AllowList::from_entries(["example.com", "192.168.1.1"]);

        assert!(list.contains("example.com"));
        assert!(!list.contains("www.example.com"));
        assert!(!list.contains("ample.com"));
        assert!(list.contains("192.168.1.1"));
    }

    #[test]
    fn test_scheme_and_port_ignored() {
        let list = AllowList::from_entries(["example.com"]);

        assert!(list.allows(&Url::parse("https://example.com/login").unwrap()));
        assert!(list.allows(&Url::parse("http://example.com:8080/").unwrap()));
        assert!(!list.allows(&Url::parse("https://sub.example.com/").unwrap()));
        assert!(!list.allows(&Url::parse("file:///example.com").unwrap()));
    }

    #[test]
    fn test_blank_entries_dropped() {
        let list = AllowList::from_entries(["", "  ", "a.example"]);
        assert_eq!(list.len(), 1);
    }

    #[tokio::test]
    async fn test_load_from_storage() {
        let storage = Storage::in_memory();
        assert!(AllowList::load(&storage).await.unwrap().is_empty());

        storage
            .set(ALLOWED_DOMAIN_LIST, &vec!["bank.example".to_string()])
            .await
            .unwrap();
        let list = AllowList::load(&storage).await.unwrap();
        assert!(list.contains("bank.example"));
    }
}
