//! Shared hub state.
//!
//! One owned [`HubShared`] per director process, behind a single coarse
//! `tokio::sync::Mutex`. The lock is held only for discrete operations
//! (registration, broadcast enqueue, registry mutation, history append) and
//! never across socket I/O or timer waits. Enqueueing to every outbox under
//! this one lock is what gives the cross-subscriber ordering guarantee.

use crate::config::HubConfig;
use crate::events::DirectorEvent;
use crate::history::History;
use crate::registry::MonitorRegistry;
use bk_protocol::{Envelope, codes};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::AbortHandle;

/// Hub lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Why a connection ended. Doubles as the close-frame reason and the
/// `client_disconnected` event reason.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer closed or the socket errored.
    SocketClosed,
    ServerShutdown,
    ProtocolViolation,
    MalformedEnvelope,
    SlowConsumer,
    Timeout,
}

impl DisconnectReason {
    pub fn code(self) -> &'static str {
        match self {
            DisconnectReason::SocketClosed => "SOCKET_CLOSED",
            DisconnectReason::ServerShutdown => codes::SERVER_SHUTDOWN,
            DisconnectReason::ProtocolViolation => codes::PROTOCOL_VIOLATION,
            DisconnectReason::MalformedEnvelope => codes::MALFORMED_ENVELOPE,
            DisconnectReason::SlowConsumer => codes::SLOW_CONSUMER,
            DisconnectReason::Timeout => codes::TIMEOUT,
        }
    }
}

/// Snapshot of one connected caster, for `list_clients` and events.
#[derive(Clone, Debug, Serialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub name: String,
    pub display_monitor_ids: Vec<String>,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    /// Millisecond timestamp of the last inbound frame.
    pub last_seen_ms: u64,
    /// Envelopes dropped from this subscriber's outbox so far.
    pub dropped: u64,
}

/// Snapshot of the hub for the shell's status row.
#[derive(Clone, Debug, Serialize)]
pub struct ServerStatus {
    pub lifecycle: Lifecycle,
    pub running: bool,
    pub port: Option<u16>,
    pub clients: usize,
    pub monitors: usize,
}

/// Server-side record of one Active connection.
///
/// The outbox is the subscriber's bounded ring: a single-subscriber
/// broadcast channel whose overflow drops the oldest unsent envelope and
/// surfaces the count through `Lagged` on the write task.
pub(crate) struct ClientHandle {
    pub name: String,
    pub display_monitor_ids: Vec<String>,
    pub outbox: broadcast::Sender<Envelope>,
    pub dropped: Arc<AtomicU64>,
    pub last_seen: Arc<AtomicU64>,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    /// Targeted teardown signal; the read task exits on it and the write
    /// task drains then sends the close frame.
    pub kill: watch::Sender<Option<DisconnectReason>>,
    pub write_abort: AbortHandle,
}

impl ClientHandle {
    pub fn info(&self, client_id: &str) -> ClientInfo {
        ClientInfo {
            client_id: client_id.to_owned(),
            name: self.name.clone(),
            display_monitor_ids: self.display_monitor_ids.clone(),
            connected_at: self.connected_at,
            last_seen_ms: self.last_seen.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Everything behind the coarse lock.
pub(crate) struct HubShared {
    pub lifecycle: Lifecycle,
    pub port: Option<u16>,
    pub registry: MonitorRegistry,
    pub clients: HashMap<String, ClientHandle>,
    pub history: History,
}

impl HubShared {
    pub fn new(config: &HubConfig) -> Self {
        Self {
            lifecycle: Lifecycle::Stopped,
            port: None,
            registry: MonitorRegistry::new(),
            clients: HashMap::new(),
            history: History::new(config.history_capacity),
        }
    }
}

/// Axum handler state: handles to the shared hub plus the run's shutdown
/// signal.
#[derive(Clone)]
pub(crate) struct HubState {
    pub shared: Arc<Mutex<HubShared>>,
    pub events: broadcast::Sender<DirectorEvent>,
    pub config: Arc<HubConfig>,
    pub shutdown: watch::Receiver<bool>,
}
