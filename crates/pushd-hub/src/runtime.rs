//! Transport-side runtime shared by an app's hub.
//!
//! Owns what must outlive the hub's in-memory state: the live transports
//! (looked up by connection id, the way a routing tag would be) and the
//! serialized ledger attachment of every connection.

use pushd_core::ledger::{AttachmentStore, LedgerEntry, LedgerError};
use pushd_core::ConnectionId;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryMiss {
    #[error("no live transport")]
    NoTransport,
    #[error("outbound queue full")]
    QueueFull,
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct SocketHandle {
    conn_id: ConnectionId,
    sender: mpsc::Sender<Outbound>,
}

impl SocketHandle {
    pub fn new(conn_id: ConnectionId, sender: mpsc::Sender<Outbound>) -> Self {
        Self { conn_id, sender }
    }

    pub fn conn_id(&self) -> &ConnectionId {
        &self.conn_id
    }

    /// Never waits: a full queue is reported as a miss.
    pub fn send_text(&self, text: String) -> Result<(), DeliveryMiss> {
        self.sender
            .try_send(Outbound::Text(text))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => DeliveryMiss::QueueFull,
                mpsc::error::TrySendError::Closed(_) => DeliveryMiss::Closed,
            })
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.sender.try_send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

pub struct SocketRuntime {
    sockets: RwLock<HashMap<ConnectionId, Vec<SocketHandle>>>,
    attachments: Arc<dyn AttachmentStore>,
}

impl SocketRuntime {
    pub fn new(attachments: Arc<dyn AttachmentStore>) -> Self {
        Self {
            sockets: RwLock::new(HashMap::new()),
            attachments,
        }
    }

    pub async fn attach(&self, handle: SocketHandle) {
        self.sockets
            .write()
            .await
            .entry(handle.conn_id.clone())
            .or_default()
            .push(handle);
    }

    /// Drops the transports and the attachment of `conn_id`.
    pub async fn detach(&self, conn_id: &ConnectionId) -> Vec<SocketHandle> {
        let handles = self
            .sockets
            .write()
            .await
            .remove(conn_id)
            .unwrap_or_default();
        if let Err(err) = self.attachments.remove(conn_id) {
            warn!(event = "attachment_remove_failed", conn_id = %conn_id, error = %err);
        }
        handles
    }

    /// Zero handles means the connection is already gone.
    pub async fn sockets_for(&self, conn_id: &ConnectionId) -> Vec<SocketHandle> {
        self.sockets
            .read()
            .await
            .get(conn_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn attached(&self) -> Vec<ConnectionId> {
        let mut ids = self
            .sockets
            .read()
            .await
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub async fn is_attached(&self, conn_id: &ConnectionId) -> bool {
        self.sockets.read().await.contains_key(conn_id)
    }

    pub async fn live_count(&self) -> usize {
        self.sockets.read().await.len()
    }

    pub fn serialize_attachment(
        &self,
        conn_id: &ConnectionId,
        entry: &LedgerEntry,
    ) -> Result<(), LedgerError> {
        let encoded = entry.encode()?;
        self.attachments.save(conn_id, &encoded)
    }

    pub fn deserialize_attachment(&self, conn_id: &ConnectionId) -> LedgerEntry {
        read_attachment(self.attachments.as_ref(), conn_id)
    }

    /// Loads many ledgers in one batch on the blocking pool, keeping slow
    /// backends off the async workers. A failed batch yields empty ledgers.
    pub async fn load_attachments(
        &self,
        conn_ids: Vec<ConnectionId>,
    ) -> Vec<(ConnectionId, LedgerEntry)> {
        let attachments = Arc::clone(&self.attachments);
        let fallback = conn_ids.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            conn_ids
                .into_iter()
                .map(|conn_id| {
                    let entry = read_attachment(attachments.as_ref(), &conn_id);
                    (conn_id, entry)
                })
                .collect::<Vec<_>>()
        })
        .await;
        match loaded {
            Ok(entries) => entries,
            Err(err) => {
                warn!(event = "attachment_batch_failed", error = %err);
                fallback
                    .into_iter()
                    .map(|conn_id| (conn_id, LedgerEntry::default()))
                    .collect()
            }
        }
    }
}

fn read_attachment(store: &dyn AttachmentStore, conn_id: &ConnectionId) -> LedgerEntry {
    match store.load(conn_id) {
        Ok(raw) => {
            if let Some(bytes) = raw.as_deref() {
                if let Err(err) = LedgerEntry::decode(bytes) {
                    warn!(event = "attachment_corrupt", conn_id = %conn_id, error = %err);
                }
            }
            LedgerEntry::decode_or_empty(raw.as_deref())
        }
        Err(err) => {
            warn!(event = "attachment_load_failed", conn_id = %conn_id, error = %err);
            LedgerEntry::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushd_core::ledger::MemoryAttachments;

    fn runtime() -> (SocketRuntime, Arc<MemoryAttachments>) {
        let attachments = Arc::new(MemoryAttachments::new());
        (SocketRuntime::new(attachments.clone()), attachments)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn attach_lookup_and_detach() {
        let (runtime, _) = runtime();
        let id = ConnectionId::from("conn-1");
        let (tx, mut rx) = mpsc::channel(4);
        runtime.attach(SocketHandle::new(id.clone(), tx)).await;

        assert!(runtime.is_attached(&id).await);
        assert_eq!(runtime.attached().await, vec![id.clone()]);
        let handles = runtime.sockets_for(&id).await;
        assert_eq!(handles.len(), 1);
        handles[0].send_text("hello".to_string()).expect("send");
        assert_eq!(rx.recv().await, Some(Outbound::Text("hello".to_string())));

        let detached = runtime.detach(&id).await;
        assert_eq!(detached.len(), 1);
        assert!(runtime.sockets_for(&id).await.is_empty());
        assert_eq!(runtime.live_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_reports_full_and_closed_queues() {
        let id = ConnectionId::from("conn-1");
        let (tx, rx) = mpsc::channel(1);
        let handle = SocketHandle::new(id, tx);
        handle.send_text("one".to_string()).expect("first fits");
        assert_eq!(
            handle.send_text("two".to_string()),
            Err(DeliveryMiss::QueueFull)
        );
        drop(rx);
        assert_eq!(
            handle.send_text("three".to_string()),
            Err(DeliveryMiss::Closed)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn attachments_round_trip_and_detach_forgets() {
        let (runtime, attachments) = runtime();
        let id = ConnectionId::from("conn-1");
        let (tx, _rx) = mpsc::channel(1);
        runtime.attach(SocketHandle::new(id.clone(), tx)).await;

        let mut entry = LedgerEntry::new();
        entry.subscribe("room1");
        runtime.serialize_attachment(&id, &entry).expect("save");
        assert_eq!(runtime.deserialize_attachment(&id), entry);

        attachments.save(&id, b"garbage").expect("corrupt");
        assert!(runtime.deserialize_attachment(&id).is_empty());

        runtime.detach(&id).await;
        assert_eq!(attachments.load(&id).expect("load"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn batch_load_keeps_order_and_degrades_bad_records() {
        let (runtime, attachments) = runtime();
        let good = ConnectionId::from("conn-a");
        let corrupt = ConnectionId::from("conn-b");
        let missing = ConnectionId::from("conn-c");
        let mut entry = LedgerEntry::new();
        entry.subscribe("room1");
        runtime.serialize_attachment(&good, &entry).expect("save");
        attachments.save(&corrupt, b"{broken").expect("corrupt");

        let loaded = runtime
            .load_attachments(vec![good.clone(), corrupt.clone(), missing.clone()])
            .await;
        assert_eq!(
            loaded,
            vec![
                (good, entry),
                (corrupt, LedgerEntry::default()),
                (missing, LedgerEntry::default()),
            ]
        );
    }
}
