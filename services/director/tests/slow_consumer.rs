use bk_protocol::{ClientHello, Envelope, Payload, Priority};
use bk_test_utils::MockWsClient;
use director::Director;
use director::config::HubConfig;
use tokio::time::{Duration, timeout};

const MESSAGES: usize = 300;
// Large payloads fill the socket buffers fast, forcing the stalled
// subscriber's outbox to overflow while the healthy one drains normally.
const CONTENT_BYTES: usize = 8 * 1024;

async fn connect_caster(url: &str, name: &str) -> MockWsClient {
    let mut client = MockWsClient::connect(url).await.unwrap();
    let hello = Envelope::new(Payload::ClientHello(ClientHello {
        client_name: name.to_owned(),
        display_monitor_ids: vec![],
    }));
    client.send_envelope(&hello).await.unwrap();
    let welcome = client.recv_envelope().await.unwrap();
    assert!(matches!(welcome.payload, Payload::ServerWelcome(_)));
    let sync = client.recv_envelope().await.unwrap();
    assert!(matches!(sync.payload, Payload::MonitorListSync(_)));
    client
}

#[tokio::test]
async fn stalled_subscriber_is_isolated_and_eventually_dropped() {
    let config = HubConfig {
        outbox_capacity: 8,
        slow_consumer_max_dropped: 64,
        ..HubConfig::default()
    };
    let director = Director::new(config);
    let port = director.start(0).await.expect("hub start");
    let url = format!("ws://127.0.0.1:{port}/ws");

    let fast = connect_caster(&url, "fast").await;
    let mut stalled = connect_caster(&url, "stalled").await;

    // The fast caster drains concurrently; the stalled one reads nothing.
    let reader = tokio::spawn(async move {
        let mut fast = fast;
        let mut seen = Vec::with_capacity(MESSAGES);
        while seen.len() < MESSAGES {
            let envelope = fast.recv_envelope().await.expect("fast caster stays served");
            if let Payload::KanpeMessage(k) = envelope.payload {
                let (seq, _) = k.content.split_once(' ').expect("sequenced content");
                seen.push(seq.parse::<usize>().expect("numeric prefix"));
            }
        }
        seen
    });

    let filler = "x".repeat(CONTENT_BYTES);
    for i in 0..MESSAGES {
        director
            .send_kanpe(
                vec!["ALL".to_owned()],
                &format!("{i} {filler}"),
                Priority::Normal,
            )
            .await
            .unwrap();
    }

    let seen = timeout(Duration::from_secs(15), reader)
        .await
        .expect("fast caster must not be delayed by the stalled one")
        .unwrap();
    assert_eq!(seen, (0..MESSAGES).collect::<Vec<_>>());

    // The stalled caster wakes up to find dropped frames and a
    // SLOW_CONSUMER close.
    let (code, reason) = timeout(Duration::from_secs(10), stalled.recv_close())
        .await
        .expect("stalled caster must be disconnected")
        .unwrap();
    assert_eq!(code, 1008);
    assert_eq!(reason, "SLOW_CONSUMER");

    // Only the stalled subscriber was removed.
    let remaining = director.list_clients().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].name, "fast");

    director.stop().await;
}

#[tokio::test]
async fn overflow_drops_are_counted_per_subscriber() {
    let config = HubConfig {
        outbox_capacity: 4,
        // High threshold: this test watches the counter, not the disconnect.
        slow_consumer_max_dropped: u64::MAX,
        ..HubConfig::default()
    };
    let director = Director::new(config);
    let port = director.start(0).await.expect("hub start");
    let url = format!("ws://127.0.0.1:{port}/ws");

    let stalled = connect_caster(&url, "stalled").await;

    let filler = "x".repeat(CONTENT_BYTES);
    for i in 0..MESSAGES {
        director
            .send_kanpe(
                vec!["ALL".to_owned()],
                &format!("{i} {filler}"),
                Priority::Normal,
            )
            .await
            .unwrap();
    }

    // Drain late: the blocked write task wakes up, sees how far the outbox
    // lagged, and records the drops.
    let drain = tokio::spawn(async move {
        let mut stalled = stalled;
        while stalled.recv_envelope().await.is_ok() {}
    });

    // Give the write task time to observe the overflow.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let clients = director.list_clients().await;
        assert_eq!(clients.len(), 1);
        if clients[0].dropped > 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "drop counter never moved"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    director.stop().await;
    drain.abort();
}
