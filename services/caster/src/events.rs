//! Typed events emitted by the client session for the shell.
//!
//! Every inbound envelope surfaces here; `displayed` carries the display
//! filter's verdict so the UI renders without re-deriving it.

use bk_protocol::{KanpePayload, VirtualMonitor};
use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CasterEvent {
    ConnectionEstablished {
        server_address: String,
    },
    ConnectionLost {
        reason: String,
    },
    ServerWelcomeReceived {
        server_name: String,
        assigned_client_id: String,
    },
    KanpeMessageReceived {
        envelope_id: String,
        kanpe: KanpePayload,
        displayed: bool,
    },
    FlashReceived {
        target_monitor_ids: Vec<String>,
        displayed: bool,
    },
    ClearReceived {
        target_monitor_ids: Vec<String>,
        displayed: bool,
    },
    MonitorListReceived {
        monitors: Vec<VirtualMonitor>,
    },
    MonitorAdded {
        monitor: VirtualMonitor,
    },
    MonitorRemoved {
        monitor_id: String,
    },
    MonitorUpdated {
        monitor: VirtualMonitor,
    },
}
