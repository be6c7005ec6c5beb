//! Control plane.
//!
//! Commands sent by the popup. Each message names its sender page; only the
//! extension's own popup is obeyed.

use crate::switch::BlockingSwitch;
use pa_storage::{NOTIFICATIONS_ALLOWED, Storage, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Control plane errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Message from unexpected origin: {0}")]
    UntrustedSender(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Popup commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// State the popup needs to render
    PopupInit,
    /// Turn blocking on or off
    ToggleEnabled { value: bool },
    SetNotificationsAllowed { value: bool },
    /// Read any stored key
    GetItemInLocal {
        key: String,
        #[serde(default, rename = "defaultValue")]
        default_value: Value,
    },
    /// Write any stored key
    SetItemInLocal { key: String, value: Value },
}

/// A command plus the URL of the page that sent it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: String,
    #[serde(flatten)]
    pub command: Command,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, command: Command) -> Self {
        Self {
            sender: sender.into(),
            command,
        }
    }

    /// Decode a raw message.
    pub fn from_value(raw: Value) -> Result<Self, ControlError> {
        serde_json::from_value(raw).map_err(|e| ControlError::Malformed(e.to_string()))
    }
}

/// Command results
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    PopupInit {
        #[serde(rename = "isListening")]
        is_listening: bool,
        #[serde(rename = "notificationsAllowed")]
        notifications_allowed: bool,
    },
    Item(Value),
    /// Command done, nothing to return (serializes as `null`)
    Ack,
}

/// Executes popup commands
#[derive(Clone)]
pub struct ControlPlane {
    trusted_sender: String,
    storage: Storage,
    switch: BlockingSwitch,
}

impl ControlPlane {
    /// `trusted_sender` is the full popup page URL.
    pub fn new(trusted_sender: impl Into<String>, storage: Storage, switch: BlockingSwitch) -> Self {
        Self {
            trusted_sender: trusted_sender.into(),
            storage,
            switch,
        }
    }

    pub fn trusted_sender(&self) -> &str {
        &self.trusted_sender
    }

    /// Check the sender and run the command.
    pub async fn dispatch(&self, envelope: Envelope) -> Result<Response, ControlError> {
        if envelope.sender != self.trusted_sender {
            warn!("Message from unexpected origin: {}", envelope.sender);
            return Err(ControlError::UntrustedSender(envelope.sender));
        }
        self.execute(envelope.command).await
    }

    async fn execute(&self, command: Command) -> Result<Response, ControlError> {
        debug!("Control command: {:?}", command);

        match command {
            Command::PopupInit => Ok(Response::PopupInit {
                is_listening: self.switch.is_listening().await,
                notifications_allowed: self.storage.get_or(NOTIFICATIONS_ALLOWED, true).await?,
            }),
            Command::ToggleEnabled { value } => {
                self.switch.set_enabled(value).await;
                Ok(Response::Ack)
            }
            Command::SetNotificationsAllowed { value } => {
                self.storage.set(NOTIFICATIONS_ALLOWED, &value).await?;
                Ok(Response::Ack)
            }
            Command::GetItemInLocal { key, default_value } => {
                Ok(Response::Item(self.storage.get_raw(&key, default_value).await?))
            }
            Command::SetItemInLocal { key, value } => {
                self.storage.set_raw(&key, value).await?;
                Ok(Response::Ack)
            }
        }
    }
}
