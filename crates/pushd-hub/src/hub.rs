//! Per-app hub: connection lifecycle, subscriptions and channel fan-out.
//!
//! All handlers of one app serialize on the `state` mutex, so index and ledger
//! mutations never interleave. The in-memory state can be dropped at any time
//! (hibernation); it is rebuilt from the ledger attachments of every attached
//! connection the next time a handler needs it.

use crate::runtime::{DeliveryMiss, Outbound, SocketHandle, SocketRuntime};
use pushd_core::index::ChannelIndex;
use pushd_core::ledger::{LedgerEntry, LedgerError};
use pushd_core::protocol::{
    encode_event, validate_channel_name, AutoResponse, ChannelKind, ChannelNameError,
    ClientMessage, FrameError, OutboundEvent, CLIENT_EVENT_PREFIX,
};
use pushd_core::{instance_id_from_name, ConnectionId};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),
    #[error("invalid channel name: {0}")]
    InvalidChannel(#[from] ChannelNameError),
    #[error("{kind} channel {channel} requires authorization")]
    UnauthorizedChannel { channel: String, kind: ChannelKind },
    #[error("unknown event {0}")]
    UnknownEvent(String),
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Protocol(_) => "protocol_error",
            DispatchError::InvalidChannel(_) => "invalid_channel",
            DispatchError::UnauthorizedChannel { .. } => "unauthorized_channel",
            DispatchError::UnknownEvent(_) => "unknown_event",
            DispatchError::ConnectionClosed(_) => "connection_closed",
            DispatchError::Ledger(_) => "ledger_error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub recipients: usize,
    pub delivered: usize,
    pub missed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    Subscribed { channel: String },
    Unsubscribed { channel: String, was_member: bool },
    Published(FanoutReport),
}

#[derive(Debug, Clone)]
pub struct Accepted {
    pub conn_id: ConnectionId,
    pub auto_response: AutoResponse,
}

/// In-memory state of one hub incarnation. Discarded on hibernation.
#[derive(Debug, Default)]
pub struct HubState {
    index: ChannelIndex,
    live_connections: u64,
}

impl HubState {
    /// Folds the ledger of every attached connection into an empty index.
    pub async fn revive(runtime: &SocketRuntime) -> Self {
        let attached = runtime.attached().await;
        let live_connections = attached.len() as u64;
        let ledgers = runtime.load_attachments(attached).await;
        let index = ChannelIndex::rebuild(ledgers.iter().map(|(conn_id, entry)| (conn_id, entry)));
        Self {
            index,
            live_connections,
        }
    }

    pub fn index(&self) -> &ChannelIndex {
        &self.index
    }

    pub fn live_connections(&self) -> u64 {
        self.live_connections
    }
}

pub struct AppHub {
    app_key: String,
    instance_id: String,
    activity_timeout_secs: u64,
    runtime: SocketRuntime,
    state: Mutex<Option<HubState>>,
    conn_seq: AtomicU64,
    last_activity: Mutex<Instant>,
}

impl AppHub {
    pub fn new(app_key: &str, activity_timeout_secs: u64, runtime: SocketRuntime) -> Self {
        Self {
            app_key: app_key.to_string(),
            instance_id: instance_id_from_name(app_key),
            activity_timeout_secs,
            runtime,
            state: Mutex::new(None),
            conn_seq: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    pub fn runtime(&self) -> &SocketRuntime {
        &self.runtime
    }

    fn next_conn_id(&self) -> ConnectionId {
        let seq = self.conn_seq.fetch_add(1, Ordering::SeqCst) + 1;
        ConnectionId::mint_now(&self.instance_id, seq)
    }

    async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    /// Locks the hub state, reviving it first if it was hibernated.
    async fn live_state(&self) -> MutexGuard<'_, Option<HubState>> {
        let mut guard = self.state.lock().await;
        if guard.is_none() {
            let revived = HubState::revive(&self.runtime).await;
            info!(
                event = "hub_revived",
                app = %self.app_key,
                connections = revived.live_connections,
                channels = revived.index.channel_count(),
                subscriptions = revived.index.subscription_count()
            );
            *guard = Some(revived);
        }
        guard
    }

    pub async fn accept(&self, sender: mpsc::Sender<Outbound>) -> Result<Accepted, DispatchError> {
        self.touch().await;
        let mut guard = self.live_state().await;
        let conn_id = self.next_conn_id();
        let established = encode_event(&OutboundEvent::connection_established(
            conn_id.as_str(),
            self.activity_timeout_secs,
        )?)?;
        let handle = SocketHandle::new(conn_id.clone(), sender);

        self.runtime.attach(handle.clone()).await;
        if let Err(err) = self
            .runtime
            .serialize_attachment(&conn_id, &LedgerEntry::new())
        {
            warn!(event = "attachment_init_failed", conn_id = %conn_id, error = %err);
        }
        if let Err(miss) = handle.send_text(established) {
            warn!(event = "established_send_failed", conn_id = %conn_id, error = %miss);
        }

        if let Some(state) = guard.as_mut() {
            state.live_connections += 1;
        }
        info!(event = "client_connected", app = %self.app_key, conn_id = %conn_id);
        Ok(Accepted {
            conn_id,
            auto_response: AutoResponse::heartbeat(),
        })
    }

    pub async fn dispatch(
        &self,
        conn_id: &ConnectionId,
        message: ClientMessage,
    ) -> Result<Dispatched, DispatchError> {
        self.touch().await;
        if !self.runtime.is_attached(conn_id).await {
            return Err(DispatchError::ConnectionClosed(conn_id.clone()));
        }
        match message {
            ClientMessage::Subscribe { channel, auth } => {
                self.subscribe(conn_id, &channel, auth.as_deref()).await
            }
            ClientMessage::Unsubscribe { channel } => self.unsubscribe(conn_id, &channel).await,
            ClientMessage::ClientEvent {
                event,
                channel,
                data,
            } => self
                .publish(conn_id, &event, &channel, data)
                .await
                .map(Dispatched::Published),
            other => Err(DispatchError::UnknownEvent(other.event_name().to_string())),
        }
    }

    pub async fn subscribe(
        &self,
        conn_id: &ConnectionId,
        channel: &str,
        _auth: Option<&str>,
    ) -> Result<Dispatched, DispatchError> {
        validate_channel_name(channel)?;
        let kind = ChannelKind::of(channel);
        if kind.requires_auth() {
            // No authorizer exists, so private and presence channels fail closed.
            return Err(DispatchError::UnauthorizedChannel {
                channel: channel.to_string(),
                kind,
            });
        }

        let mut guard = self.live_state().await;
        let mut ledger = self.runtime.deserialize_attachment(conn_id);
        if ledger.subscribe(channel) {
            self.runtime.serialize_attachment(conn_id, &ledger)?;
        }
        if let Some(state) = guard.as_mut() {
            state.index.insert(channel, conn_id);
        }

        // Acked under the state lock so no relayed event overtakes the ack.
        let ack = encode_event(&OutboundEvent::subscription_succeeded(channel))?;
        for handle in self.runtime.sockets_for(conn_id).await {
            if let Err(miss) = handle.send_text(ack.clone()) {
                debug!(event = "ack_miss", conn_id = %conn_id, error = %miss);
            }
        }
        drop(guard);
        info!(event = "subscribed", app = %self.app_key, conn_id = %conn_id, channel = channel);
        Ok(Dispatched::Subscribed {
            channel: channel.to_string(),
        })
    }

    pub async fn unsubscribe(
        &self,
        conn_id: &ConnectionId,
        channel: &str,
    ) -> Result<Dispatched, DispatchError> {
        let mut guard = self.live_state().await;
        let mut ledger = self.runtime.deserialize_attachment(conn_id);
        let was_member = ledger.unsubscribe(channel);
        if was_member {
            self.runtime.serialize_attachment(conn_id, &ledger)?;
        }
        if let Some(state) = guard.as_mut() {
            state.index.remove(channel, conn_id);
        }
        if was_member {
            info!(event = "unsubscribed", app = %self.app_key, conn_id = %conn_id, channel = channel);
        }
        Ok(Dispatched::Unsubscribed {
            channel: channel.to_string(),
            was_member,
        })
    }

    /// Best-effort fan-out of a `client-` event to every subscriber of
    /// `channel`, the origin included when it is subscribed itself.
    pub async fn publish(
        &self,
        origin: &ConnectionId,
        event: &str,
        channel: &str,
        data: Option<Value>,
    ) -> Result<FanoutReport, DispatchError> {
        if !event.starts_with(CLIENT_EVENT_PREFIX) {
            return Err(DispatchError::UnknownEvent(event.to_string()));
        }
        let frame = encode_event(&OutboundEvent::client_event(event, channel, data))?;

        let guard = self.live_state().await;
        let recipients = guard
            .as_ref()
            .map(|state| state.index.subscribers(channel))
            .unwrap_or_default();

        let mut report = FanoutReport {
            recipients: recipients.len(),
            ..FanoutReport::default()
        };
        for conn_id in &recipients {
            let handles = self.runtime.sockets_for(conn_id).await;
            if handles.is_empty() {
                report.missed += 1;
                let miss = DeliveryMiss::NoTransport;
                debug!(event = "delivery_miss", conn_id = %conn_id, error = %miss);
                continue;
            }
            for handle in handles {
                match handle.send_text(frame.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(miss) => {
                        report.missed += 1;
                        debug!(event = "delivery_miss", conn_id = %conn_id, error = %miss);
                    }
                }
            }
        }
        drop(guard);

        debug!(
            event = "client_event_fanout",
            app = %self.app_key,
            origin = %origin,
            channel = channel,
            client_event = event,
            delivered = report.delivered,
            missed = report.missed
        );
        Ok(report)
    }

    /// Removes the connection from every channel in its ledger, then terminates
    /// its transport. Safe to call for an already closed connection.
    pub async fn close(&self, conn_id: &ConnectionId, code: u16, reason: &str) {
        if !self.runtime.is_attached(conn_id).await {
            return;
        }
        let mut guard = self.live_state().await;
        if !self.runtime.is_attached(conn_id).await {
            return;
        }
        let ledger = self.runtime.deserialize_attachment(conn_id);
        let mut removed = 0;
        if let Some(state) = guard.as_mut() {
            // An unreadable ledger must not leave the id behind in the live index.
            let mut channels = state.index.channels_of(conn_id);
            channels.extend(ledger.channels().map(str::to_string));
            removed = state
                .index
                .remove_connection(conn_id, channels.iter().map(String::as_str));
            state.live_connections = state.live_connections.saturating_sub(1);
        }
        let handles = self.runtime.detach(conn_id).await;
        drop(guard);

        for handle in handles {
            handle.close(code, reason);
        }
        info!(
            event = "client_disconnected",
            app = %self.app_key,
            conn_id = %conn_id,
            code = code,
            reason = reason,
            channels = removed
        );
    }

    /// Transport errors are only logged; the transport follows up with a close.
    pub fn error(&self, conn_id: &ConnectionId, error: &dyn fmt::Display) {
        warn!(event = "client_error", app = %self.app_key, conn_id = %conn_id, error = %error);
    }

    /// Drops the in-memory state. Returns false if it was already evicted.
    pub async fn hibernate(&self) -> bool {
        let evicted = self.state.lock().await.take().is_some();
        if evicted {
            info!(event = "hub_hibernated", app = %self.app_key);
        }
        evicted
    }

    pub async fn is_hibernating(&self) -> bool {
        self.state.lock().await.is_none()
    }

    pub async fn evict_if_idle(&self, idle_after: Duration) -> bool {
        let idle_for = self.last_activity.lock().await.elapsed();
        if idle_for < idle_after {
            return false;
        }
        self.hibernate().await
    }

    pub async fn channel_snapshot(&self) -> BTreeMap<String, BTreeSet<ConnectionId>> {
        self.live_state()
            .await
            .as_ref()
            .map(|state| state.index.snapshot())
            .unwrap_or_default()
    }

    pub async fn live_connections(&self) -> u64 {
        self.live_state()
            .await
            .as_ref()
            .map(HubState::live_connections)
            .unwrap_or_default()
    }

    pub fn ledger_of(&self, conn_id: &ConnectionId) -> LedgerEntry {
        self.runtime.deserialize_attachment(conn_id)
    }
}
