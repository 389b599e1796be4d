//! Typed events emitted by the hub for the shell.
//!
//! The shell (desktop windows, web page, Stream Deck plugin) is an external
//! collaborator: it subscribes to this broadcast stream through an adapter
//! and translates to whatever notification mechanism it uses. Variants
//! serialize with a `type` tag so adapters can forward them as JSON verbatim.

use crate::state::ClientInfo;
use bk_protocol::{FeedbackPayload, VirtualMonitor};
use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DirectorEvent {
    ServerStarted {
        port: u16,
    },
    ServerStopped,
    ClientConnected {
        client: ClientInfo,
    },
    ClientDisconnected {
        client_id: String,
        reason: String,
    },
    FeedbackReceived {
        envelope_id: String,
        feedback: FeedbackPayload,
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
