/// Contract golden tests: load each JSON example file, deserialize to Rust
/// types, serialize back to JSON, and verify round-trip fidelity.
use bk_protocol::{Envelope, Payload, Priority};

/// Helper: load a JSON example file and assert round-trip.
///
/// Returns the deserialized envelope so callers can inspect fields.
fn round_trip(relative_path: &str) -> Envelope {
    // Example files live next to the workspace root, not the crate root.
    // Cargo sets CARGO_MANIFEST_DIR to the crate directory; we walk up two
    // levels to reach the workspace root.
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let workspace_root = std::path::Path::new(manifest_dir)
        .parent()
        .expect("crates/")
        .parent()
        .expect("workspace root");

    let file_path = workspace_root.join(relative_path);
    let json_text = std::fs::read_to_string(&file_path)
        .unwrap_or_else(|e| panic!("Failed to read {}: {}", file_path.display(), e));

    let envelope = Envelope::decode(&json_text)
        .unwrap_or_else(|e| panic!("Failed to decode {}: {}", file_path.display(), e));

    let serialized = envelope
        .encode()
        .unwrap_or_else(|e| panic!("Failed to encode {}: {}", file_path.display(), e));

    let original_json: serde_json::Value = serde_json::from_str(&json_text).unwrap();
    let roundtrip_json: serde_json::Value = serde_json::from_str(&serialized).unwrap();
    assert_eq!(
        original_json,
        roundtrip_json,
        "Round-trip mismatch for {}",
        file_path.display()
    );

    envelope
}

#[test]
fn client_hello_round_trip() {
    let env = round_trip("contracts/ws/v1/examples/client_hello.json");
    match env.payload {
        Payload::ClientHello(inner) => {
            assert!(!inner.client_name.is_empty());
            assert_eq!(inner.display_monitor_ids.len(), 2);
        }
        other => panic!("Expected ClientHello, got {other:?}"),
    }
}

#[test]
fn server_welcome_round_trip() {
    let env = round_trip("contracts/ws/v1/examples/server_welcome.json");
    match env.payload {
        Payload::ServerWelcome(inner) => {
            assert!(!inner.server_name.is_empty());
            assert!(!inner.assigned_client_id.is_empty());
        }
        other => panic!("Expected ServerWelcome, got {other:?}"),
    }
}

#[test]
fn monitor_list_sync_round_trip() {
    let env = round_trip("contracts/ws/v1/examples/monitor_list_sync.json");
    match env.payload {
        Payload::MonitorListSync(inner) => {
            assert_eq!(inner.monitors.len(), 2);
            // Optional presentation hints may be absent entirely.
            assert!(inner.monitors[0].description.is_some());
            assert!(inner.monitors[1].description.is_none());
        }
        other => panic!("Expected MonitorListSync, got {other:?}"),
    }
}

#[test]
fn monitor_delta_round_trips() {
    let added = round_trip("contracts/ws/v1/examples/monitor_added.json");
    match added.payload {
        Payload::MonitorAdded(m) => assert_eq!(m.name, "Interpreter"),
        other => panic!("Expected MonitorAdded, got {other:?}"),
    }

    let removed = round_trip("contracts/ws/v1/examples/monitor_removed.json");
    match removed.payload {
        Payload::MonitorRemoved(m) => assert_eq!(m.monitor_id, "m-77c2e4a8"),
        other => panic!("Expected MonitorRemoved, got {other:?}"),
    }

    let updated = round_trip("contracts/ws/v1/examples/monitor_updated.json");
    match updated.payload {
        Payload::MonitorUpdated(m) => assert_eq!(m.name, "Host (EN)"),
        other => panic!("Expected MonitorUpdated, got {other:?}"),
    }
}

#[test]
fn kanpe_message_round_trip() {
    let env = round_trip("contracts/ws/v1/examples/kanpe_message.json");
    match env.payload {
        Payload::KanpeMessage(inner) => {
            assert!(!inner.content.is_empty());
            assert!(!inner.target_monitor_ids.is_empty());
            assert_eq!(inner.priority, Priority::High);
        }
        other => panic!("Expected KanpeMessage, got {other:?}"),
    }
}

#[test]
fn flash_and_clear_round_trips() {
    let flash = round_trip("contracts/ws/v1/examples/flash_command.json");
    match flash.payload {
        Payload::FlashCommand(inner) => {
            assert!(bk_protocol::targets_all(&inner.target_monitor_ids));
        }
        other => panic!("Expected FlashCommand, got {other:?}"),
    }

    let clear = round_trip("contracts/ws/v1/examples/clear_command.json");
    match clear.payload {
        Payload::ClearCommand(inner) => assert_eq!(inner.target_monitor_ids.len(), 2),
        other => panic!("Expected ClearCommand, got {other:?}"),
    }
}

#[test]
fn feedback_message_round_trip() {
    let env = round_trip("contracts/ws/v1/examples/feedback_message.json");
    match env.payload {
        Payload::FeedbackMessage(inner) => {
            assert!(!inner.content.is_empty());
            assert!(!inner.reply_to_message_id.is_empty());
        }
        other => panic!("Expected FeedbackMessage, got {other:?}"),
    }
}

#[test]
fn ping_pong_round_trips_and_pong_echoes_ping_id() {
    let ping = round_trip("contracts/ws/v1/examples/ping.json");
    let pong = round_trip("contracts/ws/v1/examples/pong.json");
    assert_eq!(ping.payload, Payload::Ping);
    assert_eq!(pong.payload, Payload::Pong);
    assert_eq!(ping.id, pong.id, "pong must echo the ping id");
    assert!(pong.timestamp >= ping.timestamp);
}
