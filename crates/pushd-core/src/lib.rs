pub mod index;
pub mod ledger;
pub mod protocol;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Hex characters of the app-key digest kept in an instance id.
const INSTANCE_ID_HEX_LEN: usize = 16;

/// Opaque identifier of one attached connection.
///
/// Minted once at accept time from the hub instance identity and the creation
/// timestamp. A per-instance sequence number is appended so two connections
/// accepted within the same millisecond still get distinct ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn mint(instance_id: &str, created_at_ms: i64, seq: u64) -> Self {
        Self(format!("{instance_id}--{created_at_ms}.{seq}"))
    }

    pub fn mint_now(instance_id: &str, seq: u64) -> Self {
        Self::mint(instance_id, Utc::now().timestamp_millis(), seq)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Deterministic hub instance identity for an app name, so every client of
/// the same app lands on the same instance.
pub fn instance_id_from_name(name: &str) -> String {
    let mut digest = sha256_hex(name.as_bytes());
    digest.truncate(INSTANCE_ID_HEX_LEN);
    digest
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Established,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("invalid connection transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Established => "established",
            ConnectionState::Closed => "closed",
        }
    }

    /// Entered only after `connection_established` has been sent.
    pub fn establish(self) -> Result<Self, StateError> {
        match self {
            ConnectionState::Connecting => Ok(ConnectionState::Established),
            other => Err(StateError::InvalidTransition {
                from: other.as_str(),
                to: ConnectionState::Established.as_str(),
            }),
        }
    }

    /// Closed is terminal; closing twice is harmless.
    pub fn close(self) -> Self {
        ConnectionState::Closed
    }

    pub fn accepts_frames(self) -> bool {
        matches!(self, ConnectionState::Established)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
