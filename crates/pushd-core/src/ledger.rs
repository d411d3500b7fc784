//! Per-connection subscription ledger.
//!
//! The ledger entry is the durable source of truth for which channels a
//! connection has joined. It is persisted through an [`AttachmentStore`] next
//! to the connection and re-read whenever the hub rebuilds its channel index.

use crate::ConnectionId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("ledger encode failed: {0}")]
    Encode(String),
    #[error("ledger decode failed: {0}")]
    Decode(String),
    #[error("attachment backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(default)]
    pub subscriptions: BTreeSet<String>,
}

impl LedgerEntry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the channel was already present.
    pub fn subscribe(&mut self, channel: &str) -> bool {
        self.subscriptions.insert(channel.to_string())
    }

    pub fn unsubscribe(&mut self, channel: &str) -> bool {
        self.subscriptions.remove(channel)
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.subscriptions.contains(channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, LedgerError> {
        serde_json::to_vec(self).map_err(|err| LedgerError::Encode(err.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LedgerError> {
        serde_json::from_slice(bytes).map_err(|err| LedgerError::Decode(err.to_string()))
    }

    /// A missing or unreadable attachment counts as "no subscriptions" so one
    /// bad record cannot poison an index rebuild.
    pub fn decode_or_empty(bytes: Option<&[u8]>) -> Self {
        bytes
            .and_then(|raw| Self::decode(raw).ok())
            .unwrap_or_default()
    }
}

/// Storage for serialized per-connection attachments.
pub trait AttachmentStore: Send + Sync {
    fn save(&self, conn_id: &ConnectionId, attachment: &[u8]) -> Result<(), LedgerError>;
    fn load(&self, conn_id: &ConnectionId) -> Result<Option<Vec<u8>>, LedgerError>;
    fn remove(&self, conn_id: &ConnectionId) -> Result<(), LedgerError>;
    fn clear(&self) -> Result<(), LedgerError>;
}

#[derive(Debug, Default)]
pub struct MemoryAttachments {
    entries: Mutex<HashMap<ConnectionId, Vec<u8>>>,
}

impl MemoryAttachments {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut HashMap<ConnectionId, Vec<u8>>) -> T,
    ) -> Result<T, LedgerError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| LedgerError::Backend("attachment map poisoned".to_string()))?;
        Ok(f(&mut entries))
    }
}

impl AttachmentStore for MemoryAttachments {
    fn save(&self, conn_id: &ConnectionId, attachment: &[u8]) -> Result<(), LedgerError> {
        self.with_entries(|entries| {
            entries.insert(conn_id.clone(), attachment.to_vec());
        })
    }

    fn load(&self, conn_id: &ConnectionId) -> Result<Option<Vec<u8>>, LedgerError> {
        self.with_entries(|entries| entries.get(conn_id).cloned())
    }

    fn remove(&self, conn_id: &ConnectionId) -> Result<(), LedgerError> {
        self.with_entries(|entries| {
            entries.remove(conn_id);
        })
    }

    fn clear(&self) -> Result<(), LedgerError> {
        self.with_entries(HashMap::clear)
    }
}
