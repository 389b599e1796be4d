//! Loopback control API for Stream Deck and web-caster bridges.
//!
//! One JSON object in, one out, per WebSocket message on `/ws`. The
//! listener binds loopback only and the handler additionally refuses
//! non-loopback peers. Malformed requests get a failed `result` without
//! closing the socket, so a misbehaving bridge plugin cannot wedge itself.

use crate::session::Caster;
use axum::Router;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bk_protocol::{Envelope, FeedbackType, Payload, Priority, VirtualMonitor, codes};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeRequest {
    /// Standalone feedback using the caster's bound client name.
    SendFeedback {
        content: String,
        feedback_type: FeedbackType,
    },
    /// Feedback derived from the most recent kanpe that passed the display
    /// filter; standalone when there is none.
    ReactToLatest { feedback_type: FeedbackType },
    GetState,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeResponse {
    Result {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    StateUpdate {
        connected: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        latest_message: Option<LatestMessage>,
        monitors: Vec<VirtualMonitor>,
    },
}

impl BridgeResponse {
    fn ok() -> Self {
        BridgeResponse::Result {
            success: true,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        BridgeResponse::Result {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// The latest displayed kanpe, flattened for button labels.
#[derive(Debug, Serialize)]
pub struct LatestMessage {
    pub id: String,
    pub content: String,
    pub target_monitor_ids: Vec<String>,
    pub priority: Priority,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bind failed on port {port}: {source}")]
    BindFailed {
        port: u16,
        source: std::io::Error,
    },
    #[error("bridge already running")]
    AlreadyRunning,
}

impl BridgeError {
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::BindFailed { .. } => codes::BIND_FAILED,
            BridgeError::AlreadyRunning => codes::INVALID_ARGUMENT,
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

pub(crate) struct BridgeTask {
    port: u16,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct BridgeState {
    caster: Caster,
}

impl Caster {
    /// Start the loopback control API. Pass port 0 for an OS-assigned port;
    /// the bound port is returned either way.
    pub async fn start_bridge(&self, port: u16) -> Result<u16, BridgeError> {
        let mut slot = self.bridge_slot().lock().await;
        if slot.is_some() {
            return Err(BridgeError::AlreadyRunning);
        }

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|source| {
                error!(port, code = codes::BIND_FAILED, error = %source, "bridge bind failed");
                BridgeError::BindFailed { port, source }
            })?;
        let local_port = listener
            .local_addr()
            .expect("local_addr always succeeds after bind")
            .port();

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let router = Router::new()
            .route("/ws", get(bridge_ws_handler))
            .with_state(BridgeState {
                caster: self.clone(),
            });
        let task = tokio::spawn(async move {
            let graceful = async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            };
            if let Err(e) = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(graceful)
            .await
            {
                error!(error = %e, "bridge listener failed");
            }
        });

        *slot = Some(BridgeTask {
            port: local_port,
            shutdown_tx,
            task,
        });
        info!(port = local_port, "bridge listening on loopback");
        Ok(local_port)
    }

    /// Stop the control API. Idempotent.
    pub async fn stop_bridge(&self) {
        let Some(bridge) = self.bridge_slot().lock().await.take() else {
            return;
        };
        let _ = bridge.shutdown_tx.send(true);
        bridge.task.abort();
        info!("bridge stopped");
    }

    /// The bound port while the bridge is running.
    pub async fn bridge_status(&self) -> Option<u16> {
        self.bridge_slot().lock().await.as_ref().map(|b| b.port)
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn bridge_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<BridgeState>,
) -> Response {
    if !peer.ip().is_loopback() {
        warn!(peer = %peer, "refused non-loopback bridge peer");
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| handle_bridge_socket(socket, state))
        .into_response()
}

async fn handle_bridge_socket(mut socket: WebSocket, state: BridgeState) {
    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            Message::Text(text) => {
                let response = match serde_json::from_str::<BridgeRequest>(&text) {
                    Ok(request) => handle_request(&state.caster, request).await,
                    Err(e) => BridgeResponse::failed(format!("malformed request: {e}")),
                };
                let Ok(json) = serde_json::to_string(&response) else {
                    continue;
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

async fn handle_request(caster: &Caster, request: BridgeRequest) -> BridgeResponse {
    match request {
        BridgeRequest::SendFeedback {
            content,
            feedback_type,
        } => {
            let client_name = caster.client_name().await;
            match caster
                .send_feedback(&content, &client_name, "", feedback_type)
                .await
            {
                Ok(_) => BridgeResponse::ok(),
                Err(e) => BridgeResponse::failed(e.to_string()),
            }
        }
        BridgeRequest::ReactToLatest { feedback_type } => {
            let client_name = caster.client_name().await;
            let latest = caster.latest_displayed().await;
            let (content, reply_to) = match latest.as_ref() {
                Some(Envelope {
                    id,
                    payload: Payload::KanpeMessage(kanpe),
                    ..
                }) => (kanpe.content.clone(), id.clone()),
                _ => (feedback_type.label().to_owned(), String::new()),
            };
            match caster
                .send_feedback(&content, &client_name, &reply_to, feedback_type)
                .await
            {
                Ok(_) => BridgeResponse::ok(),
                Err(e) => BridgeResponse::failed(e.to_string()),
            }
        }
        BridgeRequest::GetState => {
            let status = caster.status().await;
            let latest_message = caster.latest_displayed().await.and_then(|envelope| {
                match envelope.payload {
                    Payload::KanpeMessage(kanpe) => Some(LatestMessage {
                        id: envelope.id,
                        content: kanpe.content,
                        target_monitor_ids: kanpe.target_monitor_ids,
                        priority: kanpe.priority,
                    }),
                    _ => None,
                }
            });
            BridgeResponse::StateUpdate {
                connected: status.connected,
                latest_message,
                monitors: status.monitors,
            }
        }
    }
}
