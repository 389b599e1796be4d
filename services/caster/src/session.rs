//! Client session: dial, handshake, receive/filter loop, auto-reconnect.
//!
//! A single supervisor task owns the connection lifecycle. Each attempt
//! dials, sends `client_hello`, and waits for `server_welcome`; the session
//! loop then feeds every inbound envelope to the event bus, applying the
//! display filter and maintaining the monitor mirror. Transient failures
//! never surface as hard errors while auto-reconnect is on — they set
//! `last_disconnect_reason` and enter jittered exponential backoff.

use crate::backoff::Backoff;
use crate::events::CasterEvent;
use crate::filter::is_displayed;
use crate::state::{ClientShared, ClientStatus, SessionState};
use bk_protocol::{
    ClientHello, Envelope, FeedbackPayload, FeedbackType, Payload, codes,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_CHANNEL_CAPACITY: usize = 32;

// ---------------------------------------------------------------------------
// Errors and policy
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("not connected")]
    NotConnected,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NotConnected => codes::NOT_CONNECTED,
            SessionError::InvalidArgument(_) => codes::INVALID_ARGUMENT,
        }
    }
}

/// Reconnect policy; fixed by config at construction, applied across every
/// reconnect cycle.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub auto_reconnect: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            initial_backoff: crate::backoff::DEFAULT_INITIAL,
            max_backoff: crate::backoff::DEFAULT_MAX,
        }
    }
}

/// How one connection attempt ended.
enum ConnOutcome {
    /// Explicit disconnect or process shutdown; leave Idle, no reconnect.
    Shutdown,
    /// Handshake-level violation; leave Idle even with auto-reconnect on.
    Fatal(&'static str),
    /// Transient loss; reconnect when the policy allows.
    Retry(&'static str),
}

// ---------------------------------------------------------------------------
// Caster handle
// ---------------------------------------------------------------------------

struct SessionTask {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Handle to the caster core. Cheap to clone; the shell's adapter and the
/// local control API both hold one.
#[derive(Clone)]
pub struct Caster {
    shared: Arc<Mutex<ClientShared>>,
    events: broadcast::Sender<CasterEvent>,
    policy: Arc<ReconnectPolicy>,
    session: Arc<Mutex<Option<SessionTask>>>,
    bridge: Arc<Mutex<Option<crate::bridge::BridgeTask>>>,
}

impl Caster {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Mutex::new(ClientShared::new())),
            events,
            policy: Arc::new(policy),
            session: Arc::new(Mutex::new(None)),
            bridge: Arc::new(Mutex::new(None)),
        }
    }

    /// Subscribe to the typed event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<CasterEvent> {
        self.events.subscribe()
    }

    /// Start a session toward `server_address`. Tears down any previous
    /// session first; `client_name` and `display_monitor_ids` survive every
    /// reconnect until the next `connect`.
    pub async fn connect(
        &self,
        server_address: &str,
        client_name: &str,
        display_monitor_ids: Vec<String>,
    ) {
        self.disconnect().await;

        let address = crate::config::normalize_server_address(server_address);
        {
            let mut shared = self.shared.lock().await;
            shared.server_address = Some(address.clone());
            shared.client_name = client_name.to_owned();
            shared.display_monitor_ids = display_monitor_ids;
            shared.state = SessionState::Dialing;
            shared.last_disconnect_reason = None;
        }
        info!(address = %address, client_name, "connecting to hub");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervisor(
            self.shared.clone(),
            self.events.clone(),
            self.policy.as_ref().clone(),
            shutdown_rx,
        ));
        *self.session.lock().await = Some(SessionTask { shutdown_tx, task });
    }

    /// Force Idle; no reconnect follows. Idempotent.
    pub async fn disconnect(&self) {
        let task = self.session.lock().await.take();
        if let Some(task) = task {
            let _ = task.shutdown_tx.send(true);
            let _ = task.task.await;
        }
        let mut shared = self.shared.lock().await;
        shared.state = SessionState::Idle;
        shared.outbound = None;
    }

    /// Send typed feedback; allowed only while Connected.
    ///
    /// Frames are at-most-once: a send that races a socket failure is lost
    /// and never replayed by the next reconnect.
    pub async fn send_feedback(
        &self,
        content: &str,
        client_name: &str,
        reply_to_message_id: &str,
        feedback_type: FeedbackType,
    ) -> Result<Envelope, SessionError> {
        if content.trim().is_empty() {
            return Err(SessionError::InvalidArgument(
                "content must not be empty".to_owned(),
            ));
        }
        let outbound = {
            let shared = self.shared.lock().await;
            if shared.state != SessionState::Connected {
                return Err(SessionError::NotConnected);
            }
            shared.outbound.clone().ok_or(SessionError::NotConnected)?
        };
        let envelope = Envelope::new(Payload::FeedbackMessage(FeedbackPayload {
            content: content.to_owned(),
            client_name: client_name.to_owned(),
            reply_to_message_id: reply_to_message_id.to_owned(),
            feedback_type,
        }));
        outbound
            .send(envelope.clone())
            .await
            .map_err(|_| SessionError::NotConnected)?;
        Ok(envelope)
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.lock().await.state == SessionState::Connected
    }

    /// Full client-state snapshot for the shell and the control API.
    pub async fn status(&self) -> ClientStatus {
        self.shared.lock().await.status()
    }

    /// The monitor mirror; the UI reads only this.
    pub async fn monitors(&self) -> Vec<bk_protocol::VirtualMonitor> {
        self.shared.lock().await.monitors.clone()
    }

    /// The kanpe envelope that most recently passed the display filter.
    pub async fn latest_displayed(&self) -> Option<Envelope> {
        self.shared.lock().await.latest_displayed.clone()
    }

    pub async fn client_name(&self) -> String {
        self.shared.lock().await.client_name.clone()
    }

    pub(crate) fn bridge_slot(&self) -> &Arc<Mutex<Option<crate::bridge::BridgeTask>>> {
        &self.bridge
    }
}

// ---------------------------------------------------------------------------
// Supervisor: dial / handshake / session / backoff
// ---------------------------------------------------------------------------

async fn supervisor(
    shared: Arc<Mutex<ClientShared>>,
    events: broadcast::Sender<CasterEvent>,
    policy: ReconnectPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(policy.initial_backoff, policy.max_backoff);

    loop {
        let (address, client_name, display_monitor_ids) = {
            let shared = shared.lock().await;
            (
                shared.server_address.clone().unwrap_or_default(),
                shared.client_name.clone(),
                shared.display_monitor_ids.clone(),
            )
        };
        set_state(&shared, SessionState::Dialing).await;

        let dial = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                set_state(&shared, SessionState::Idle).await;
                return;
            }
            res = tokio_tungstenite::connect_async(address.as_str()) => res,
        };

        let outcome = match dial {
            Err(e) => {
                record_disconnect(&shared, &events, codes::DIAL_FAILED, &e.to_string()).await;
                ConnOutcome::Retry(codes::DIAL_FAILED)
            }
            Ok((ws, _response)) => {
                run_connection(
                    ws,
                    &shared,
                    &events,
                    &address,
                    &client_name,
                    display_monitor_ids,
                    &mut backoff,
                    &mut shutdown,
                )
                .await
            }
        };

        match outcome {
            ConnOutcome::Shutdown => {
                set_state(&shared, SessionState::Idle).await;
                return;
            }
            ConnOutcome::Fatal(code) => {
                record_disconnect(&shared, &events, code, "handshake rejected").await;
                set_state(&shared, SessionState::Idle).await;
                return;
            }
            ConnOutcome::Retry(_) => {
                if !policy.auto_reconnect {
                    set_state(&shared, SessionState::Idle).await;
                    return;
                }
                set_state(&shared, SessionState::Reconnecting).await;
                if !sleep_backoff(&mut backoff, &mut shutdown).await {
                    set_state(&shared, SessionState::Idle).await;
                    return;
                }
            }
        }
    }
}

/// One dialed socket: hello, welcome, then the session loop.
#[allow(clippy::too_many_arguments)]
async fn run_connection<S>(
    mut ws: S,
    shared: &Arc<Mutex<ClientShared>>,
    events: &broadcast::Sender<CasterEvent>,
    address: &str,
    client_name: &str,
    display_monitor_ids: Vec<String>,
    backoff: &mut Backoff,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnOutcome
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    set_state(shared, SessionState::Handshaking).await;

    let hello = Envelope::new(Payload::ClientHello(ClientHello {
        client_name: client_name.to_owned(),
        display_monitor_ids,
    }));
    if send_envelope(&mut ws, &hello).await.is_err() {
        record_disconnect(shared, events, "SOCKET_CLOSED", "hello send failed").await;
        return ConnOutcome::Retry("SOCKET_CLOSED");
    }

    let welcome = match tokio::time::timeout(HANDSHAKE_TIMEOUT, wait_for_welcome(&mut ws, shutdown))
        .await
    {
        Err(_) => {
            record_disconnect(shared, events, codes::TIMEOUT, "no server_welcome").await;
            return ConnOutcome::Retry(codes::TIMEOUT);
        }
        Ok(FirstFrame::Shutdown) => {
            let _ = ws.send(Message::Close(None)).await;
            return ConnOutcome::Shutdown;
        }
        Ok(FirstFrame::Closed) => {
            record_disconnect(shared, events, "SOCKET_CLOSED", "closed before welcome").await;
            return ConnOutcome::Retry("SOCKET_CLOSED");
        }
        Ok(FirstFrame::Violation(code)) => {
            let _ = ws.send(Message::Close(None)).await;
            return ConnOutcome::Fatal(code);
        }
        Ok(FirstFrame::Welcome(welcome)) => welcome,
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
    {
        let mut shared = shared.lock().await;
        shared.state = SessionState::Connected;
        shared.server_name = Some(welcome.server_name.clone());
        shared.assigned_client_id = Some(welcome.assigned_client_id.clone());
        shared.outbound = Some(outbound_tx);
    }
    backoff.reset();
    info!(
        server_name = %welcome.server_name,
        client_id = %welcome.assigned_client_id,
        "connected to hub"
    );
    let _ = events.send(CasterEvent::ServerWelcomeReceived {
        server_name: welcome.server_name,
        assigned_client_id: welcome.assigned_client_id,
    });
    let _ = events.send(CasterEvent::ConnectionEstablished {
        server_address: address.to_owned(),
    });

    let outcome = run_session(&mut ws, shared, events, outbound_rx, shutdown).await;
    shared.lock().await.outbound = None;
    if let ConnOutcome::Retry(code) = &outcome {
        record_disconnect(shared, events, code, "session ended").await;
    }
    outcome
}

enum FirstFrame {
    Welcome(bk_protocol::ServerWelcome),
    Violation(&'static str),
    Closed,
    Shutdown,
}

async fn wait_for_welcome<S>(ws: &mut S, shutdown: &mut watch::Receiver<bool>) -> FirstFrame
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => return FirstFrame::Shutdown,
            msg = ws.next() => match msg {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return FirstFrame::Closed,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Text(text))) => {
                    return match Envelope::decode(&text) {
                        Err(_) => FirstFrame::Violation(codes::MALFORMED_ENVELOPE),
                        Ok(Envelope { payload: Payload::ServerWelcome(welcome), .. }) => {
                            FirstFrame::Welcome(welcome)
                        }
                        Ok(envelope) => {
                            warn!(
                                tag = envelope.payload.tag(),
                                code = codes::PROTOCOL_VIOLATION,
                                "expected server_welcome as first frame"
                            );
                            FirstFrame::Violation(codes::PROTOCOL_VIOLATION)
                        }
                    };
                }
                Some(Ok(_)) => return FirstFrame::Violation(codes::PROTOCOL_VIOLATION),
            }
        }
    }
}

/// Connected-state loop: pump outbound frames and dispatch inbound ones.
async fn run_session<S>(
    ws: &mut S,
    shared: &Arc<Mutex<ClientShared>>,
    events: &broadcast::Sender<CasterEvent>,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnOutcome
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                let _ = ws.send(Message::Close(None)).await;
                return ConnOutcome::Shutdown;
            }
            outbound = outbound_rx.recv() => match outbound {
                Some(envelope) => {
                    if send_envelope(ws, &envelope).await.is_err() {
                        return ConnOutcome::Retry("SOCKET_CLOSED");
                    }
                }
                None => return ConnOutcome::Retry("SOCKET_CLOSED"),
            },
            msg = ws.next() => match msg {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {
                    return ConnOutcome::Retry("SOCKET_CLOSED");
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Text(text))) => {
                    match Envelope::decode(&text) {
                        Err(e) => {
                            warn!(code = codes::MALFORMED_ENVELOPE, error = %e, "undecodable frame");
                            let _ = ws.send(Message::Close(None)).await;
                            return ConnOutcome::Retry(codes::MALFORMED_ENVELOPE);
                        }
                        Ok(envelope) => match envelope.payload {
                            Payload::Ping => {
                                let pong = Envelope::with_id(envelope.id, Payload::Pong);
                                if send_envelope(ws, &pong).await.is_err() {
                                    return ConnOutcome::Retry("SOCKET_CLOSED");
                                }
                            }
                            Payload::Pong => {}
                            _ => {
                                if let Some(outcome) =
                                    handle_envelope(shared, events, envelope).await
                                {
                                    let _ = ws.send(Message::Close(None)).await;
                                    return outcome;
                                }
                            }
                        },
                    }
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

/// Apply one inbound envelope to the mirror/filter state and emit its event.
/// `Some(outcome)` ends the connection.
async fn handle_envelope(
    shared: &Arc<Mutex<ClientShared>>,
    events: &broadcast::Sender<CasterEvent>,
    envelope: Envelope,
) -> Option<ConnOutcome> {
    match envelope.payload {
        Payload::KanpeMessage(kanpe) => {
            let displayed = {
                let mut shared = shared.lock().await;
                let displayed = is_displayed(&kanpe.target_monitor_ids, &shared.display_monitor_ids);
                if displayed {
                    shared.latest_displayed = Some(Envelope {
                        id: envelope.id.clone(),
                        timestamp: envelope.timestamp,
                        payload: Payload::KanpeMessage(kanpe.clone()),
                    });
                }
                displayed
            };
            debug!(envelope_id = %envelope.id, displayed, "kanpe received");
            let _ = events.send(CasterEvent::KanpeMessageReceived {
                envelope_id: envelope.id,
                kanpe,
                displayed,
            });
            None
        }
        Payload::FlashCommand(command) => {
            let displayed = {
                let shared = shared.lock().await;
                is_displayed(&command.target_monitor_ids, &shared.display_monitor_ids)
            };
            let _ = events.send(CasterEvent::FlashReceived {
                target_monitor_ids: command.target_monitor_ids,
                displayed,
            });
            None
        }
        Payload::ClearCommand(command) => {
            let displayed = {
                let mut shared = shared.lock().await;
                let displayed =
                    is_displayed(&command.target_monitor_ids, &shared.display_monitor_ids);
                if displayed {
                    shared.latest_displayed = None;
                }
                displayed
            };
            let _ = events.send(CasterEvent::ClearReceived {
                target_monitor_ids: command.target_monitor_ids,
                displayed,
            });
            None
        }
        Payload::MonitorListSync(sync) => {
            shared.lock().await.monitors = sync.monitors.clone();
            let _ = events.send(CasterEvent::MonitorListReceived {
                monitors: sync.monitors,
            });
            None
        }
        Payload::MonitorAdded(monitor) => {
            {
                let mut shared = shared.lock().await;
                if let Some(slot) = shared.monitors.iter_mut().find(|m| m.id == monitor.id) {
                    *slot = monitor.clone();
                } else {
                    shared.monitors.push(monitor.clone());
                }
            }
            let _ = events.send(CasterEvent::MonitorAdded { monitor });
            None
        }
        Payload::MonitorUpdated(monitor) => {
            {
                let mut shared = shared.lock().await;
                if let Some(slot) = shared.monitors.iter_mut().find(|m| m.id == monitor.id) {
                    *slot = monitor.clone();
                } else {
                    shared.monitors.push(monitor.clone());
                }
            }
            let _ = events.send(CasterEvent::MonitorUpdated { monitor });
            None
        }
        Payload::MonitorRemoved(removed) => {
            shared
                .lock()
                .await
                .monitors
                .retain(|m| m.id != removed.monitor_id);
            let _ = events.send(CasterEvent::MonitorRemoved {
                monitor_id: removed.monitor_id,
            });
            None
        }
        other => {
            warn!(
                tag = other.tag(),
                code = codes::PROTOCOL_VIOLATION,
                "unexpected frame from hub"
            );
            Some(ConnOutcome::Retry(codes::PROTOCOL_VIOLATION))
        }
    }
}

// ---------------------------------------------------------------------------
// Small helpers
// ---------------------------------------------------------------------------

async fn send_envelope<S>(ws: &mut S, envelope: &Envelope) -> Result<(), ()>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let Ok(json) = envelope.encode() else {
        return Ok(());
    };
    ws.send(Message::Text(json.into())).await.map_err(|_| ())
}

async fn set_state(shared: &Arc<Mutex<ClientShared>>, state: SessionState) {
    shared.lock().await.state = state;
}

async fn record_disconnect(
    shared: &Arc<Mutex<ClientShared>>,
    events: &broadcast::Sender<CasterEvent>,
    code: &str,
    detail: &str,
) {
    shared.lock().await.last_disconnect_reason = Some(code.to_owned());
    warn!(code, detail, "connection lost");
    let _ = events.send(CasterEvent::ConnectionLost {
        reason: code.to_owned(),
    });
}

/// Sleep one backoff tick; false means shutdown was requested.
async fn sleep_backoff(backoff: &mut Backoff, shutdown: &mut watch::Receiver<bool>) -> bool {
    let delay = backoff.next_delay();
    debug!(delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "reconnect backoff");
    tokio::select! {
        biased;
        _ = shutdown.changed() => false,
        () = tokio::time::sleep(delay) => true,
    }
}
