//! Shared client-session state.
//!
//! One owned [`ClientShared`] per caster process behind a single coarse
//! `tokio::sync::Mutex`; held only for discrete reads/writes, never across
//! socket I/O. The monitor mirror and the latest displayed message have one
//! writer (the receive task); everything else reads snapshots.

use bk_protocol::{Envelope, VirtualMonitor};
use serde::Serialize;
use tokio::sync::mpsc;

/// Client session lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Dialing,
    Handshaking,
    Connected,
    Reconnecting,
}

/// Everything behind the caster's coarse lock.
pub(crate) struct ClientShared {
    pub state: SessionState,
    pub server_address: Option<String>,
    pub server_name: Option<String>,
    pub assigned_client_id: Option<String>,
    pub client_name: String,
    pub display_monitor_ids: Vec<String>,
    /// Mirror of the hub registry; replaced wholesale on sync, mutated in
    /// place on deltas. The UI reads only this.
    pub monitors: Vec<VirtualMonitor>,
    pub last_disconnect_reason: Option<String>,
    /// The kanpe envelope that most recently passed the display filter.
    pub latest_displayed: Option<Envelope>,
    /// Sender into the live connection's write half; present only while
    /// Connected.
    pub outbound: Option<mpsc::Sender<Envelope>>,
}

impl ClientShared {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            server_address: None,
            server_name: None,
            assigned_client_id: None,
            client_name: String::new(),
            display_monitor_ids: Vec::new(),
            monitors: Vec::new(),
            last_disconnect_reason: None,
            latest_displayed: None,
            outbound: None,
        }
    }

    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            state: self.state,
            connected: self.state == SessionState::Connected,
            server_address: self.server_address.clone(),
            server_name: self.server_name.clone(),
            assigned_client_id: self.assigned_client_id.clone(),
            client_name: self.client_name.clone(),
            display_monitor_ids: self.display_monitor_ids.clone(),
            monitors: self.monitors.clone(),
            last_disconnect_reason: self.last_disconnect_reason.clone(),
        }
    }
}

/// Snapshot of the full client state for the shell.
#[derive(Clone, Debug, Serialize)]
pub struct ClientStatus {
    pub state: SessionState,
    pub connected: bool,
    pub server_address: Option<String>,
    pub server_name: Option<String>,
    pub assigned_client_id: Option<String>,
    pub client_name: String,
    pub display_monitor_ids: Vec<String>,
    pub monitors: Vec<VirtualMonitor>,
    pub last_disconnect_reason: Option<String>,
}
