//! Hub WebSocket endpoint: handshake, read/write tasks, keepalive.
//!
//! One read task and one write task per accepted socket. The write task
//! drains the subscriber's outbox and is the only place that touches the
//! sink; the read task owns keepalive and inbound dispatch. Teardown is
//! funneled through [`remove_client`], which is idempotent so the read task,
//! the write task, and `stop()` can all race to it safely.

use crate::events::DirectorEvent;
use crate::state::{ClientHandle, DisconnectReason, HubState, Lifecycle};
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use bk_protocol::{
    ClientHello, Envelope, MonitorListSync, Payload, ServerWelcome, codes, now_millis,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<HubState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: HubState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // The hub sends nothing until it has seen a valid client_hello.
    let hello = match wait_for_hello(&mut ws_rx, &state).await {
        Ok(hello) => hello,
        Err(reason) => {
            warn!(code = reason.code(), "handshake failed");
            let _ = ws_tx
                .send(Message::Close(Some(close_frame(Some(reason)))))
                .await;
            return;
        }
    };

    let client_id = format!("c-{}", Uuid::new_v4());
    let (outbox_tx, outbox_rx) = broadcast::channel(state.config.outbox_capacity);
    let (kill_tx, kill_rx) = watch::channel(None);
    let dropped = Arc::new(AtomicU64::new(0));
    let last_seen = Arc::new(AtomicU64::new(now_millis()));
    let connected_at = chrono::Utc::now();

    let write_task = tokio::spawn(write_loop(
        ws_tx,
        outbox_rx,
        kill_rx.clone(),
        dropped.clone(),
        state.clone(),
        client_id.clone(),
    ));

    // Registration and the welcome/sync pair happen under the one state
    // lock: no registry delta or directive can slip in between, which is the
    // handshake-atomicity guarantee.
    let registered = {
        let mut shared = state.shared.lock().await;
        if shared.lifecycle == Lifecycle::Running {
            let welcome = Envelope::new(Payload::ServerWelcome(ServerWelcome {
                server_name: state.config.server_name.clone(),
                assigned_client_id: client_id.clone(),
            }));
            let sync = Envelope::new(Payload::MonitorListSync(MonitorListSync {
                monitors: shared.registry.snapshot(),
            }));
            let _ = outbox_tx.send(welcome);
            let _ = outbox_tx.send(sync);
            shared.clients.insert(
                client_id.clone(),
                ClientHandle {
                    name: hello.client_name.clone(),
                    display_monitor_ids: hello.display_monitor_ids.clone(),
                    outbox: outbox_tx.clone(),
                    dropped: dropped.clone(),
                    last_seen: last_seen.clone(),
                    connected_at,
                    kill: kill_tx,
                    write_abort: write_task.abort_handle(),
                },
            );
            true
        } else {
            false
        }
    };
    if !registered {
        write_task.abort();
        return;
    }

    let client = crate::state::ClientInfo {
        client_id: client_id.clone(),
        name: hello.client_name.clone(),
        display_monitor_ids: hello.display_monitor_ids.clone(),
        connected_at,
        last_seen_ms: last_seen.load(Ordering::Relaxed),
        dropped: 0,
    };
    let _ = state.events.send(DirectorEvent::ClientConnected { client });
    info!(client_id = %client_id, name = %hello.client_name, "caster connected");

    let reason = read_loop(&mut ws_rx, &state, &client_id, &outbox_tx, kill_rx, &last_seen).await;
    remove_client(&state, &client_id, reason).await;
}

/// Wait for the mandatory first frame.
///
/// WS-level control frames are tolerated before the hello; everything else
/// is a violation.
async fn wait_for_hello(
    ws_rx: &mut SplitStream<WebSocket>,
    state: &HubState,
) -> Result<ClientHello, DisconnectReason> {
    let deadline = tokio::time::sleep(state.config.hello_timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => return Err(DisconnectReason::Timeout),
            msg = ws_rx.next() => match msg {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {
                    return Err(DisconnectReason::SocketClosed);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Binary(_))) => return Err(DisconnectReason::ProtocolViolation),
                Some(Ok(Message::Text(text))) => {
                    let envelope =
                        Envelope::decode(&text).map_err(|_| DisconnectReason::MalformedEnvelope)?;
                    match envelope.payload {
                        Payload::ClientHello(hello) => return Ok(hello),
                        other => {
                            warn!(tag = other.tag(), "expected client_hello as first frame");
                            return Err(DisconnectReason::ProtocolViolation);
                        }
                    }
                }
            }
        }
    }
}

/// Inbound dispatch + keepalive for one Active connection.
async fn read_loop(
    ws_rx: &mut SplitStream<WebSocket>,
    state: &HubState,
    client_id: &str,
    outbox: &broadcast::Sender<Envelope>,
    mut kill_rx: watch::Receiver<Option<DisconnectReason>>,
    last_seen: &AtomicU64,
) -> DisconnectReason {
    let mut shutdown = state.shutdown.clone();
    let mut keepalive = tokio::time::interval(state.config.keepalive_interval);
    keepalive.tick().await;
    let timeout_ms = state.config.keepalive_timeout.as_millis();

    loop {
        tokio::select! {
            biased;
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    return DisconnectReason::ServerShutdown;
                }
            }
            res = kill_rx.changed() => {
                let reason = if res.is_ok() { *kill_rx.borrow_and_update() } else { None };
                return reason.unwrap_or(DisconnectReason::SocketClosed);
            }
            _ = keepalive.tick() => {
                let idle = now_millis().saturating_sub(last_seen.load(Ordering::Relaxed));
                if u128::from(idle) >= timeout_ms {
                    return DisconnectReason::Timeout;
                }
                let _ = outbox.send(Envelope::new(Payload::Ping));
            }
            msg = ws_rx.next() => match msg {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {
                    return DisconnectReason::SocketClosed;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    last_seen.store(now_millis(), Ordering::Relaxed);
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!(client_id, code = codes::PROTOCOL_VIOLATION, "binary frame");
                    return DisconnectReason::ProtocolViolation;
                }
                Some(Ok(Message::Text(text))) => {
                    last_seen.store(now_millis(), Ordering::Relaxed);
                    match Envelope::decode(&text) {
                        Err(e) => {
                            warn!(client_id, code = codes::MALFORMED_ENVELOPE, error = %e, "undecodable frame");
                            return DisconnectReason::MalformedEnvelope;
                        }
                        Ok(envelope) => {
                            if let Some(reason) =
                                handle_frame(state, client_id, outbox, envelope).await
                            {
                                return reason;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Dispatch one decoded inbound envelope; `Some(reason)` ends the connection.
async fn handle_frame(
    state: &HubState,
    client_id: &str,
    outbox: &broadcast::Sender<Envelope>,
    envelope: Envelope,
) -> Option<DisconnectReason> {
    match &envelope.payload {
        Payload::FeedbackMessage(feedback) => {
            let feedback = feedback.clone();
            {
                let mut shared = state.shared.lock().await;
                shared.history.push_feedback(envelope.clone());
            }
            debug!(client_id, feedback_type = feedback.feedback_type.label(), "feedback received");
            let _ = state.events.send(DirectorEvent::FeedbackReceived {
                envelope_id: envelope.id.clone(),
                feedback,
            });
            None
        }
        Payload::Ping => {
            let _ = outbox.send(Envelope::with_id(envelope.id.clone(), Payload::Pong));
            None
        }
        Payload::Pong => None,
        other => {
            warn!(
                client_id,
                tag = other.tag(),
                code = codes::PROTOCOL_VIOLATION,
                "unexpected frame from caster"
            );
            Some(DisconnectReason::ProtocolViolation)
        }
    }
}

/// Drain the outbox into the socket; on teardown, finish the queue and send
/// the close frame.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: broadcast::Receiver<Envelope>,
    mut kill_rx: watch::Receiver<Option<DisconnectReason>>,
    dropped: Arc<AtomicU64>,
    state: HubState,
    client_id: String,
) {
    let reason = loop {
        tokio::select! {
            biased;
            res = kill_rx.changed() => {
                break if res.is_ok() { *kill_rx.borrow_and_update() } else { None };
            }
            item = rx.recv() => match item {
                Ok(envelope) => {
                    if send_envelope(&mut ws_tx, &envelope).await.is_err() {
                        return;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    let total = dropped.fetch_add(n, Ordering::Relaxed) + n;
                    warn!(
                        client_id = %client_id,
                        skipped = n,
                        total,
                        code = codes::SLOW_CONSUMER,
                        "outbox overflow, dropped oldest"
                    );
                    if total >= state.config.slow_consumer_max_dropped {
                        remove_client(&state, &client_id, DisconnectReason::SlowConsumer).await;
                    }
                }
                Err(RecvError::Closed) => break None,
            }
        }
    };

    // Final drain; bounded by stop()'s grace period, which aborts this task.
    loop {
        match rx.try_recv() {
            Ok(envelope) => {
                if send_envelope(&mut ws_tx, &envelope).await.is_err() {
                    return;
                }
            }
            Err(TryRecvError::Lagged(n)) => {
                dropped.fetch_add(n, Ordering::Relaxed);
            }
            Err(_) => break,
        }
    }
    let _ = ws_tx.send(Message::Close(Some(close_frame(reason)))).await;
}

async fn send_envelope(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    envelope: &Envelope,
) -> Result<(), ()> {
    let Ok(json) = envelope.encode() else {
        return Ok(());
    };
    ws_tx.send(Message::Text(json.into())).await.map_err(|_| ())
}

/// Remove a client, signal its tasks, and emit `client_disconnected`.
/// Idempotent: only the caller that actually removes the handle emits.
pub(crate) async fn remove_client(state: &HubState, client_id: &str, reason: DisconnectReason) {
    let handle = { state.shared.lock().await.clients.remove(client_id) };
    let Some(handle) = handle else {
        return;
    };
    let _ = handle.kill.send(Some(reason));
    info!(client_id, code = reason.code(), "caster disconnected");
    let _ = state.events.send(DirectorEvent::ClientDisconnected {
        client_id: client_id.to_owned(),
        reason: reason.code().to_owned(),
    });
}

fn close_frame(reason: Option<DisconnectReason>) -> CloseFrame {
    let (code, text) = match reason {
        None | Some(DisconnectReason::SocketClosed) => (1000, ""),
        Some(DisconnectReason::ServerShutdown) => (1001, codes::SERVER_SHUTDOWN),
        Some(DisconnectReason::ProtocolViolation) => (1002, codes::PROTOCOL_VIOLATION),
        Some(DisconnectReason::MalformedEnvelope) => (1007, codes::MALFORMED_ENVELOPE),
        Some(DisconnectReason::SlowConsumer) => (1008, codes::SLOW_CONSUMER),
        Some(DisconnectReason::Timeout) => (1008, codes::TIMEOUT),
    };
    CloseFrame {
        code,
        reason: text.into(),
    }
}
