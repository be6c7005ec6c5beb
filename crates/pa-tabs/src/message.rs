//! Tab identifiers and lifecycle events.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a browser tab.
///
/// Serializes as a bare integer so it can key the persisted per-tab maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub i64);

impl TabId {
    /// Create a new tab ID.
    pub fn new(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tab({})", self.0)
    }
}

impl From<i64> for TabId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Lifecycle notifications delivered by the browser's tab API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum TabEvent {
    /// Something about the tab changed. `url` is only present when the
    /// top-level URL is part of the change.
    #[serde(rename_all = "camelCase")]
    Updated {
        tab_id: TabId,
        #[serde(default)]
        url: Option<String>,
        /// The tab's URL after the change
        tab_url: String,
    },
    /// The tab was closed
    #[serde(rename_all = "camelCase")]
    Removed { tab_id: TabId },
}

impl TabEvent {
    /// Tab the event refers to.
    pub fn tab_id(&self) -> TabId {
        match self {
            Self::Updated { tab_id, .. } | Self::Removed { tab_id } => *tab_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tab_id_display() {
        assert_eq!(TabId::new(7).to_string(), "Tab(7)");
    }

    #[test]
    fn test_tab_event_wire_shape() {
        let event: TabEvent = serde_json::from_str(
            r#"{"event":"updated","tabId":3,"url":"https://example.com/","tabUrl":"https://example.com/"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            TabEvent::Updated {
                tab_id: TabId(3),
                url: Some("https://example.com/".to_string()),
                tab_url: "https://example.com/".to_string(),
            }
        );

        let event: TabEvent = serde_json::from_str(r#"{"event":"removed","tabId":9}"#).unwrap();
        assert_eq!(event.tab_id(), TabId(9));
    }

    #[test]
    fn test_updated_without_url() {
        let event: TabEvent =
            serde_json::from_str(r#"{"event":"updated","tabId":1,"tabUrl":"about:blank"}"#).unwrap();
        assert!(matches!(event, TabEvent::Updated { url: None, .. }));
    }
}
