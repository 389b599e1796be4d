use bk_protocol::{ClientHello, Envelope, Payload};
use bk_test_utils::MockWsClient;
use director::config::HubConfig;
use director::{Director, DirectorEvent, Lifecycle};
use tokio::time::{Duration, timeout};

async fn next_event(
    events: &mut tokio::sync::broadcast::Receiver<DirectorEvent>,
) -> DirectorEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event within deadline")
        .unwrap()
}

#[tokio::test]
async fn stop_closes_subscribers_with_server_shutdown() {
    let director = Director::new(HubConfig {
        shutdown_grace: Duration::from_millis(100),
        ..HubConfig::default()
    });
    let mut events = director.subscribe();
    let port = director.start(0).await.unwrap();
    assert!(matches!(next_event(&mut events).await, DirectorEvent::ServerStarted { .. }));

    let mut client = MockWsClient::connect(&format!("ws://127.0.0.1:{port}/ws"))
        .await
        .unwrap();
    client
        .send_envelope(&Envelope::new(Payload::ClientHello(ClientHello {
            client_name: "C".to_owned(),
            display_monitor_ids: vec![],
        })))
        .await
        .unwrap();
    let welcome = client.recv_envelope().await.unwrap();
    assert!(matches!(welcome.payload, Payload::ServerWelcome(_)));
    assert!(matches!(next_event(&mut events).await, DirectorEvent::ClientConnected { .. }));

    director.stop().await;

    let (code, reason) = timeout(Duration::from_secs(2), client.recv_close())
        .await
        .expect("close frame on shutdown")
        .unwrap();
    assert_eq!(code, 1001);
    assert_eq!(reason, "SERVER_SHUTDOWN");

    match next_event(&mut events).await {
        DirectorEvent::ClientDisconnected { reason, .. } => {
            assert_eq!(reason, "SERVER_SHUTDOWN");
        }
        other => panic!("expected client_disconnected, got {other:?}"),
    }
    assert!(matches!(next_event(&mut events).await, DirectorEvent::ServerStopped));

    let status = director.status().await;
    assert_eq!(status.lifecycle, Lifecycle::Stopped);
    assert!(!status.running);
    assert_eq!(status.port, None);
    assert_eq!(status.clients, 0);
}

#[tokio::test]
async fn status_reflects_running_hub() {
    let director = Director::new(HubConfig::default());
    let port = director.start(0).await.unwrap();

    let status = director.status().await;
    assert!(status.running);
    assert_eq!(status.lifecycle, Lifecycle::Running);
    assert_eq!(status.port, Some(port));

    director.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent() {
    let director = Director::new(HubConfig::default());
    director.stop().await;
    let port = director.start(0).await.unwrap();
    assert!(port > 0);
    director.stop().await;
    director.stop().await;
    assert!(!director.status().await.running);
}
