// bk-protocol: Bi-Kanpe wire protocol types and serialization.
//
// All WebSocket frames are UTF-8 JSON objects with a top-level `type` tag,
// an `id` (version-4 UUID) and a `timestamp` (sender-clock milliseconds).
// Tag-specific data lives under `payload`; `ping`/`pong` carry none.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Broadcast sentinel recognized only inside `target_monitor_ids` lists.
///
/// Never a valid monitor ID; the registry must never mint it.
pub const ALL_MONITORS: &str = "ALL";

// ---------------------------------------------------------------------------
// Shared sub-types
// ---------------------------------------------------------------------------

/// A named logical destination, independent of any physical device.
///
/// `id` is a short opaque string, unique within a server lifetime and never
/// reused. `description` and `color` are presentation hints; unknown extra
/// fields on the wire are ignored for forward compatibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMonitor {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Directive urgency. Presentation only; never affects delivery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Normal,
    High,
    Urgent,
}

/// Typed caster feedback category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackType {
    Ack,
    Question,
    Issue,
    Info,
}

impl FeedbackType {
    /// Wire label, also used as fallback feedback content for bridge
    /// reactions with no referent message.
    pub fn label(self) -> &'static str {
        match self {
            FeedbackType::Ack => "ack",
            FeedbackType::Question => "question",
            FeedbackType::Issue => "issue",
            FeedbackType::Info => "info",
        }
    }
}

// ---------------------------------------------------------------------------
// Caster -> Director payloads
// ---------------------------------------------------------------------------

/// First frame on every connection.
///
/// `display_monitor_ids` may be empty: the caster still receives every
/// broadcast frame (for bridging) but renders nothing unless `"ALL"` is
/// targeted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    pub client_name: String,
    #[serde(default)]
    pub display_monitor_ids: Vec<String>,
}

/// Typed feedback from a caster.
///
/// `reply_to_message_id` is the `id` of a prior kanpe envelope, or the empty
/// string for standalone feedback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackPayload {
    pub content: String,
    pub client_name: String,
    #[serde(default)]
    pub reply_to_message_id: String,
    pub feedback_type: FeedbackType,
}

// ---------------------------------------------------------------------------
// Director -> Caster payloads
// ---------------------------------------------------------------------------

/// Handshake acknowledgement; always followed by a `monitor_list_sync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerWelcome {
    pub server_name: String,
    pub assigned_client_id: String,
}

/// Full registry snapshot sent during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorListSync {
    pub monitors: Vec<VirtualMonitor>,
}

/// Registry delta for a removal; additions and updates carry the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorRemoved {
    pub monitor_id: String,
}

/// A short directive shown to a performer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KanpePayload {
    pub content: String,
    /// Non-empty ordered list; each element is a monitor ID or [`ALL_MONITORS`].
    pub target_monitor_ids: Vec<String>,
    pub priority: Priority,
}

/// Targets for `flash_command` / `clear_command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetedCommand {
    pub target_monitor_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Top-level discriminated union
// ---------------------------------------------------------------------------

/// Tag-specific payload of an envelope.
///
/// Serializes adjacently tagged:
///
/// ```json
/// { "type": "kanpe_message", "payload": { ... } }
/// ```
///
/// `ping` and `pong` serialize with no `payload` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    ClientHello(ClientHello),
    ServerWelcome(ServerWelcome),
    MonitorListSync(MonitorListSync),
    MonitorAdded(VirtualMonitor),
    MonitorRemoved(MonitorRemoved),
    MonitorUpdated(VirtualMonitor),
    KanpeMessage(KanpePayload),
    FlashCommand(TargetedCommand),
    ClearCommand(TargetedCommand),
    FeedbackMessage(FeedbackPayload),
    Ping,
    Pong,
}

impl Payload {
    /// Wire tag of this payload, for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Payload::ClientHello(_) => "client_hello",
            Payload::ServerWelcome(_) => "server_welcome",
            Payload::MonitorListSync(_) => "monitor_list_sync",
            Payload::MonitorAdded(_) => "monitor_added",
            Payload::MonitorRemoved(_) => "monitor_removed",
            Payload::MonitorUpdated(_) => "monitor_updated",
            Payload::KanpeMessage(_) => "kanpe_message",
            Payload::FlashCommand(_) => "flash_command",
            Payload::ClearCommand(_) => "clear_command",
            Payload::FeedbackMessage(_) => "feedback_message",
            Payload::Ping => "ping",
            Payload::Pong => "pong",
        }
    }
}

/// One wire message: tag + identity + sender timestamp + payload.
///
/// Immutable once minted; handlers clone instead of mutating. Timestamps are
/// sender-clock hints and must never be used to order envelopes across
/// senders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub timestamp: u64,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    /// Mint a new envelope with a fresh v4 UUID and the current wall clock.
    pub fn new(payload: Payload) -> Self {
        Envelope {
            id: Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            payload,
        }
    }

    /// Mint an envelope reusing an existing ID (pong echoes its ping's `id`).
    pub fn with_id(id: impl Into<String>, payload: Payload) -> Self {
        Envelope {
            id: id.into(),
            timestamp: now_millis(),
            payload,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Parse a JSON text frame.
    ///
    /// Fails with [`CodecError::MalformedEnvelope`] on missing fields,
    /// unknown tag, or type-mismatched payload. Unknown extra fields are
    /// ignored.
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        serde_json::from_str(text).map_err(|e| CodecError::MalformedEnvelope(e.to_string()))
    }
}

/// Milliseconds since the Unix epoch on the local clock.
pub fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

/// True when `targets` contains the [`ALL_MONITORS`] sentinel.
pub fn targets_all(targets: &[String]) -> bool {
    targets.iter().any(|t| t == ALL_MONITORS)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("envelope encode failed: {0}")]
    Encode(String),
}

/// Stable short codes attached to every logged error and close frame.
pub mod codes {
    pub const BIND_FAILED: &str = "BIND_FAILED";
    pub const DIAL_FAILED: &str = "DIAL_FAILED";
    pub const PROTOCOL_VIOLATION: &str = "PROTOCOL_VIOLATION";
    pub const MALFORMED_ENVELOPE: &str = "MALFORMED_ENVELOPE";
    pub const SLOW_CONSUMER: &str = "SLOW_CONSUMER";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";
    pub const NOT_CONNECTED: &str = "NOT_CONNECTED";
    pub const NOT_RUNNING: &str = "NOT_RUNNING";
    pub const SERVER_SHUTDOWN: &str = "SERVER_SHUTDOWN";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_envelopes_carry_unique_v4_ids() {
        let a = Envelope::new(Payload::Ping);
        let b = Envelope::new(Payload::Ping);
        assert_ne!(a.id, b.id);
        let parsed = Uuid::parse_str(&a.id).expect("id is a UUID");
        assert_eq!(parsed.get_version_num(), 4);
        assert!(a.timestamp > 0);
    }

    #[test]
    fn ping_serializes_without_payload_key() {
        let env = Envelope::with_id("abc", Payload::Ping);
        let json: serde_json::Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "ping");
        assert_eq!(json["id"], "abc");
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn pong_echoes_ping_id() {
        let ping = Envelope::new(Payload::Ping);
        let pong = Envelope::with_id(ping.id.clone(), Payload::Pong);
        assert_eq!(pong.id, ping.id);
        assert_eq!(pong.payload, Payload::Pong);
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let text = r#"{"type":"warp_command","id":"x","timestamp":1,"payload":{}}"#;
        assert!(matches!(
            Envelope::decode(text),
            Err(CodecError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn decode_rejects_missing_id() {
        let text = r#"{"type":"ping","timestamp":1}"#;
        assert!(matches!(
            Envelope::decode(text),
            Err(CodecError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn decode_rejects_type_mismatched_payload() {
        let text = r#"{"type":"kanpe_message","id":"x","timestamp":1,"payload":{"content":7,"target_monitor_ids":["ALL"],"priority":"normal"}}"#;
        assert!(matches!(
            Envelope::decode(text),
            Err(CodecError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn decode_rejects_non_json_frame() {
        assert!(Envelope::decode("{not-json").is_err());
    }

    #[test]
    fn unknown_optional_monitor_fields_are_ignored() {
        let text = r#"{"type":"monitor_added","id":"x","timestamp":1,"payload":{"id":"m-1","name":"Host","icon":"star","z_order":3}}"#;
        let env = Envelope::decode(text).expect("extra fields must be ignored");
        match env.payload {
            Payload::MonitorAdded(m) => {
                assert_eq!(m.id, "m-1");
                assert_eq!(m.name, "Host");
                assert_eq!(m.description, None);
            }
            other => panic!("expected monitor_added, got {other:?}"),
        }
    }

    #[test]
    fn hello_display_list_defaults_to_empty() {
        let text = r#"{"type":"client_hello","id":"x","timestamp":1,"payload":{"client_name":"Alice"}}"#;
        let env = Envelope::decode(text).unwrap();
        match env.payload {
            Payload::ClientHello(hello) => assert!(hello.display_monitor_ids.is_empty()),
            other => panic!("expected client_hello, got {other:?}"),
        }
    }

    #[test]
    fn feedback_reply_id_defaults_to_empty_string() {
        let text = r#"{"type":"feedback_message","id":"x","timestamp":1,"payload":{"content":"OK","client_name":"Alice","feedback_type":"ack"}}"#;
        let env = Envelope::decode(text).unwrap();
        match env.payload {
            Payload::FeedbackMessage(fb) => {
                assert_eq!(fb.reply_to_message_id, "");
                assert_eq!(fb.feedback_type, FeedbackType::Ack);
            }
            other => panic!("expected feedback_message, got {other:?}"),
        }
    }

    #[test]
    fn targets_all_matches_only_the_sentinel() {
        let with = vec!["m-1".to_owned(), ALL_MONITORS.to_owned()];
        let without = vec!["m-1".to_owned(), "all".to_owned()];
        assert!(targets_all(&with));
        assert!(!targets_all(&without));
    }

    #[test]
    fn encode_decode_round_trips_every_variant() {
        let monitor = VirtualMonitor {
            id: "m-1".to_owned(),
            name: "Host".to_owned(),
            description: Some("stage left".to_owned()),
            color: Some("#ff0000".to_owned()),
        };
        let variants = vec![
            Payload::ClientHello(ClientHello {
                client_name: "Alice".to_owned(),
                display_monitor_ids: vec!["m-1".to_owned()],
            }),
            Payload::ServerWelcome(ServerWelcome {
                server_name: "Director".to_owned(),
                assigned_client_id: "c-1".to_owned(),
            }),
            Payload::MonitorListSync(MonitorListSync {
                monitors: vec![monitor.clone()],
            }),
            Payload::MonitorAdded(monitor.clone()),
            Payload::MonitorRemoved(MonitorRemoved {
                monitor_id: "m-1".to_owned(),
            }),
            Payload::MonitorUpdated(monitor),
            Payload::KanpeMessage(KanpePayload {
                content: "Smile".to_owned(),
                target_monitor_ids: vec!["m-1".to_owned()],
                priority: Priority::High,
            }),
            Payload::FlashCommand(TargetedCommand {
                target_monitor_ids: vec![ALL_MONITORS.to_owned()],
            }),
            Payload::ClearCommand(TargetedCommand {
                target_monitor_ids: vec!["m-1".to_owned()],
            }),
            Payload::FeedbackMessage(FeedbackPayload {
                content: "OK".to_owned(),
                client_name: "Alice".to_owned(),
                reply_to_message_id: "k-1".to_owned(),
                feedback_type: FeedbackType::Question,
            }),
            Payload::Ping,
            Payload::Pong,
        ];
        for payload in variants {
            let env = Envelope::new(payload);
            let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
            assert_eq!(decoded, env);
        }
    }
}
