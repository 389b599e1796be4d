use bk_protocol::{
    ClientHello, Envelope, FeedbackPayload, FeedbackType, Payload, Priority,
};
use bk_test_utils::MockWsClient;
use director::Director;
use director::config::HubConfig;
use tokio::time::{Duration, timeout};

async fn start_hub() -> (Director, String) {
    let director = Director::new(HubConfig::default());
    let port = director.start(0).await.expect("hub start");
    (director, format!("ws://127.0.0.1:{port}/ws"))
}

/// Connect and complete the handshake, discarding welcome + sync.
async fn connect_caster(url: &str, name: &str, display: &[String]) -> MockWsClient {
    let mut client = MockWsClient::connect(url).await.unwrap();
    let hello = Envelope::new(Payload::ClientHello(ClientHello {
        client_name: name.to_owned(),
        display_monitor_ids: display.to_vec(),
    }));
    client.send_envelope(&hello).await.unwrap();
    let welcome = client.recv_envelope().await.unwrap();
    assert!(matches!(welcome.payload, Payload::ServerWelcome(_)));
    let sync = client.recv_envelope().await.unwrap();
    assert!(matches!(sync.payload, Payload::MonitorListSync(_)));
    client
}

#[tokio::test]
async fn kanpe_to_all_reaches_every_caster() {
    let (director, url) = start_hub().await;
    let a = director.add_monitor("Host", None, None).await.unwrap();
    let b = director.add_monitor("Actor", None, None).await.unwrap();

    let mut c1 = connect_caster(&url, "C1", &[a.id.clone()]).await;
    let mut c2 = connect_caster(&url, "C2", &[b.id.clone()]).await;

    director
        .send_kanpe(vec!["ALL".to_owned()], "Start", Priority::Normal)
        .await
        .unwrap();

    for client in [&mut c1, &mut c2] {
        let envelope = client.recv_envelope().await.unwrap();
        match envelope.payload {
            Payload::KanpeMessage(k) => {
                assert_eq!(k.content, "Start");
                assert_eq!(k.target_monitor_ids, vec!["ALL".to_owned()]);
            }
            other => panic!("expected kanpe_message, got {other:?}"),
        }
    }

    director.stop().await;
}

#[tokio::test]
async fn targeted_kanpe_is_broadcast_unfiltered_and_recorded() {
    let (director, url) = start_hub().await;
    let a = director.add_monitor("Host", None, None).await.unwrap();
    let b = director.add_monitor("Actor", None, None).await.unwrap();

    let mut c1 = connect_caster(&url, "C1", &[a.id.clone()]).await;
    let mut c2 = connect_caster(&url, "C2", &[b.id.clone()]).await;

    director
        .send_kanpe(vec![a.id.clone()], "Smile", Priority::High)
        .await
        .unwrap();

    // Routing is the subscriber's job: both casters get the frame, even the
    // one not displaying monitor A.
    for client in [&mut c1, &mut c2] {
        let envelope = client.recv_envelope().await.unwrap();
        match envelope.payload {
            Payload::KanpeMessage(k) => {
                assert_eq!(k.content, "Smile");
                assert_eq!(k.target_monitor_ids, vec![a.id.clone()]);
                assert_eq!(k.priority, Priority::High);
            }
            other => panic!("expected kanpe_message, got {other:?}"),
        }
    }

    let history = director.kanpe_history().await;
    assert_eq!(history.len(), 1);
    match &history[0].payload {
        Payload::KanpeMessage(k) => assert_eq!(k.target_monitor_ids, vec![a.id.clone()]),
        other => panic!("expected kanpe_message in history, got {other:?}"),
    }

    director.stop().await;
}

#[tokio::test]
async fn every_caster_sees_broadcasts_in_acceptance_order() {
    let (director, url) = start_hub().await;

    let mut c1 = connect_caster(&url, "C1", &[]).await;
    let mut c2 = connect_caster(&url, "C2", &[]).await;

    for i in 0..50 {
        director
            .send_kanpe(vec!["ALL".to_owned()], &format!("msg-{i}"), Priority::Normal)
            .await
            .unwrap();
    }

    for client in [&mut c1, &mut c2] {
        for i in 0..50 {
            let envelope = client.recv_envelope().await.unwrap();
            match envelope.payload {
                Payload::KanpeMessage(k) => assert_eq!(k.content, format!("msg-{i}")),
                other => panic!("expected kanpe_message, got {other:?}"),
            }
        }
    }

    director.stop().await;
}

#[tokio::test]
async fn flash_and_clear_are_broadcast_in_order() {
    let (director, url) = start_hub().await;
    let a = director.add_monitor("Host", None, None).await.unwrap();
    let mut client = connect_caster(&url, "C1", &[a.id.clone()]).await;

    director.send_flash(vec!["ALL".to_owned()]).await.unwrap();
    director.send_clear(vec![a.id.clone()]).await.unwrap();

    let flash = client.recv_envelope().await.unwrap();
    match flash.payload {
        Payload::FlashCommand(c) => assert_eq!(c.target_monitor_ids, vec!["ALL".to_owned()]),
        other => panic!("expected flash_command, got {other:?}"),
    }
    let clear = client.recv_envelope().await.unwrap();
    match clear.payload {
        Payload::ClearCommand(c) => assert_eq!(c.target_monitor_ids, vec![a.id.clone()]),
        other => panic!("expected clear_command, got {other:?}"),
    }

    director.stop().await;
}

#[tokio::test]
async fn feedback_is_not_rebroadcast_to_other_casters() {
    let (director, url) = start_hub().await;
    let mut events = director.subscribe();

    let mut c1 = connect_caster(&url, "Alice", &[]).await;
    let mut c2 = connect_caster(&url, "Bob", &[]).await;

    let feedback = Envelope::new(Payload::FeedbackMessage(FeedbackPayload {
        content: "OK".to_owned(),
        client_name: "Alice".to_owned(),
        reply_to_message_id: String::new(),
        feedback_type: FeedbackType::Ack,
    }));
    c1.send_envelope(&feedback).await.unwrap();

    // The hub surfaces feedback as an event...
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("feedback event within deadline")
            .unwrap();
        if let director::DirectorEvent::FeedbackReceived { feedback, .. } = event {
            assert_eq!(feedback.content, "OK");
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
    }

    // ...but never re-sends it to subscribers.
    let silent = timeout(Duration::from_millis(300), c2.recv_envelope()).await;
    assert!(silent.is_err(), "feedback must not reach other casters");

    director.stop().await;
}
