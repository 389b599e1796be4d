//! Director hub: lifecycle, broadcast engine, and the invoke surface the
//! shell calls.
//!
//! The hub owns the listener and the shared state. Directives and registry
//! deltas are fanned out unfiltered to every Active subscriber; per-monitor
//! filtering happens on the caster. Enqueueing to every outbox happens under
//! the state lock, so a subscriber never sees envelope B before an earlier
//! accepted envelope A.

use crate::config::HubConfig;
use crate::events::DirectorEvent;
use crate::registry::MonitorUpdate;
use crate::state::{
    ClientInfo, DisconnectReason, HubShared, HubState, Lifecycle, ServerStatus,
};
use bk_protocol::{
    ALL_MONITORS, Envelope, KanpePayload, Payload, Priority, TargetedCommand, VirtualMonitor,
    codes, targets_all,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("bind failed on port {port}: {source}")]
    BindFailed {
        port: u16,
        source: std::io::Error,
    },
    #[error("hub already running")]
    AlreadyRunning,
    #[error("hub is not running")]
    NotRunning,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl HubError {
    /// Stable short code for logs and shell error surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            HubError::BindFailed { .. } => codes::BIND_FAILED,
            HubError::AlreadyRunning | HubError::InvalidArgument(_) => codes::INVALID_ARGUMENT,
            HubError::NotRunning => codes::NOT_RUNNING,
            HubError::NotFound(_) => codes::NOT_FOUND,
        }
    }
}

// ---------------------------------------------------------------------------
// Director
// ---------------------------------------------------------------------------

struct ServerTask {
    shutdown_tx: watch::Sender<bool>,
    serve_task: JoinHandle<()>,
}

/// Handle to the director core. Cheap to clone; adapters for the shell hold
/// one and call the invoke surface below.
#[derive(Clone)]
pub struct Director {
    shared: Arc<Mutex<HubShared>>,
    events: broadcast::Sender<DirectorEvent>,
    config: Arc<HubConfig>,
    server: Arc<Mutex<Option<ServerTask>>>,
}

impl Director {
    pub fn new(config: HubConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let shared = HubShared::new(&config);
        Self {
            shared: Arc::new(Mutex::new(shared)),
            events,
            config: Arc::new(config),
            server: Arc::new(Mutex::new(None)),
        }
    }

    /// Subscribe to the typed event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<DirectorEvent> {
        self.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Bind the listener and start accepting casters.
    ///
    /// Pass port 0 to let the OS choose; the bound port is returned either
    /// way. Fails with [`HubError::BindFailed`] when the port is busy.
    pub async fn start(&self, port: u16) -> Result<u16, HubError> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Err(HubError::AlreadyRunning);
        }
        self.set_lifecycle(Lifecycle::Starting).await;

        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(source) => {
                self.set_lifecycle(Lifecycle::Stopped).await;
                error!(port, code = codes::BIND_FAILED, error = %source, "hub bind failed");
                return Err(HubError::BindFailed { port, source });
            }
        };
        let local_port = listener
            .local_addr()
            .expect("local_addr always succeeds after bind")
            .port();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = HubState {
            shared: self.shared.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
            shutdown: shutdown_rx.clone(),
        };
        let router = crate::build_router(state);
        let mut graceful_rx = shutdown_rx;
        let serve_task = tokio::spawn(async move {
            let graceful = async move {
                let _ = graceful_rx.wait_for(|stop| *stop).await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!(error = %e, "hub listener failed");
            }
        });

        {
            let mut shared = self.shared.lock().await;
            shared.lifecycle = Lifecycle::Running;
            shared.port = Some(local_port);
        }
        *server = Some(ServerTask {
            shutdown_tx,
            serve_task,
        });
        let _ = self.events.send(DirectorEvent::ServerStarted { port: local_port });
        info!(port = local_port, server_name = %self.config.server_name, "hub running");
        Ok(local_port)
    }

    /// Graceful shutdown: stop accepting, close every outbox, give writers
    /// the configured grace to drain, then abort whatever is left.
    ///
    /// A no-op when the hub is not running.
    pub async fn stop(&self) {
        let Some(task) = self.server.lock().await.take() else {
            return;
        };
        self.set_lifecycle(Lifecycle::Stopping).await;
        let _ = task.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut shared = self.shared.lock().await;
            shared.clients.drain().collect()
        };
        for (_, handle) in &handles {
            let _ = handle.kill.send(Some(DisconnectReason::ServerShutdown));
        }
        tokio::time::sleep(self.config.shutdown_grace).await;
        for (client_id, handle) in &handles {
            handle.write_abort.abort();
            let _ = self.events.send(DirectorEvent::ClientDisconnected {
                client_id: client_id.clone(),
                reason: DisconnectReason::ServerShutdown.code().to_owned(),
            });
        }
        task.serve_task.abort();

        {
            let mut shared = self.shared.lock().await;
            shared.lifecycle = Lifecycle::Stopped;
            shared.port = None;
        }
        let _ = self.events.send(DirectorEvent::ServerStopped);
        info!("hub stopped");
    }

    pub async fn status(&self) -> ServerStatus {
        let shared = self.shared.lock().await;
        ServerStatus {
            lifecycle: shared.lifecycle,
            running: shared.lifecycle == Lifecycle::Running,
            port: shared.port,
            clients: shared.clients.len(),
            monitors: shared.registry.len(),
        }
    }

    // -----------------------------------------------------------------------
    // Send primitives
    // -----------------------------------------------------------------------

    /// Broadcast a kanpe directive and record it in history.
    ///
    /// Rejects empty content, empty targets, and unknown monitor IDs with
    /// [`HubError::InvalidArgument`]. A target list containing the `"ALL"`
    /// sentinel is rewritten to exactly `["ALL"]`.
    pub async fn send_kanpe(
        &self,
        target_monitor_ids: Vec<String>,
        content: &str,
        priority: Priority,
    ) -> Result<Envelope, HubError> {
        if content.trim().is_empty() {
            return Err(HubError::InvalidArgument(
                "content must not be empty".to_owned(),
            ));
        }
        let mut shared = self.shared.lock().await;
        ensure_running(&shared)?;
        let targets = normalize_targets(&shared, target_monitor_ids)?;
        let envelope = Envelope::new(Payload::KanpeMessage(KanpePayload {
            content: content.to_owned(),
            target_monitor_ids: targets,
            priority,
        }));
        shared.history.push_kanpe(envelope.clone());
        fan_out(&shared, &envelope);
        Ok(envelope)
    }

    /// Broadcast a flash command (transient visual signal on the casters).
    pub async fn send_flash(
        &self,
        target_monitor_ids: Vec<String>,
    ) -> Result<Envelope, HubError> {
        self.send_targeted(target_monitor_ids, |targets| {
            Payload::FlashCommand(TargetedCommand {
                target_monitor_ids: targets,
            })
        })
        .await
    }

    /// Broadcast a clear command (wipes the casters' current message).
    pub async fn send_clear(
        &self,
        target_monitor_ids: Vec<String>,
    ) -> Result<Envelope, HubError> {
        self.send_targeted(target_monitor_ids, |targets| {
            Payload::ClearCommand(TargetedCommand {
                target_monitor_ids: targets,
            })
        })
        .await
    }

    async fn send_targeted(
        &self,
        target_monitor_ids: Vec<String>,
        make: impl FnOnce(Vec<String>) -> Payload,
    ) -> Result<Envelope, HubError> {
        let shared = self.shared.lock().await;
        ensure_running(&shared)?;
        let targets = normalize_targets(&shared, target_monitor_ids)?;
        let envelope = Envelope::new(make(targets));
        fan_out(&shared, &envelope);
        Ok(envelope)
    }

    // -----------------------------------------------------------------------
    // Registry mutations
    // -----------------------------------------------------------------------

    /// Create a virtual monitor; its delta goes out to every connected
    /// caster. Allowed while the hub is stopped (pre-show setup).
    pub async fn add_monitor(
        &self,
        name: &str,
        description: Option<String>,
        color: Option<String>,
    ) -> Result<VirtualMonitor, HubError> {
        if name.trim().is_empty() {
            return Err(HubError::InvalidArgument(
                "monitor name must not be empty".to_owned(),
            ));
        }
        let monitor = {
            let mut shared = self.shared.lock().await;
            let monitor = shared.registry.add(name, description, color);
            let envelope = Envelope::new(Payload::MonitorAdded(monitor.clone()));
            fan_out(&shared, &envelope);
            monitor
        };
        let _ = self.events.send(DirectorEvent::MonitorAdded {
            monitor: monitor.clone(),
        });
        Ok(monitor)
    }

    /// Remove a monitor; idempotent. Returns whether anything was removed —
    /// absent IDs produce no delta and no event.
    pub async fn remove_monitor(&self, id: &str) -> bool {
        let removed = {
            let mut shared = self.shared.lock().await;
            let removed = shared.registry.remove(id).is_some();
            if removed {
                let envelope = Envelope::new(Payload::MonitorRemoved(bk_protocol::MonitorRemoved {
                    monitor_id: id.to_owned(),
                }));
                fan_out(&shared, &envelope);
            }
            removed
        };
        if removed {
            let _ = self.events.send(DirectorEvent::MonitorRemoved {
                monitor_id: id.to_owned(),
            });
        }
        removed
    }

    /// Apply a partial update; fails with [`HubError::NotFound`] when the ID
    /// is absent.
    pub async fn update_monitor(
        &self,
        id: &str,
        update: MonitorUpdate,
    ) -> Result<VirtualMonitor, HubError> {
        if update.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(HubError::InvalidArgument(
                "monitor name must not be empty".to_owned(),
            ));
        }
        let monitor = {
            let mut shared = self.shared.lock().await;
            let Some(monitor) = shared.registry.update(id, update) else {
                return Err(HubError::NotFound(format!("monitor {id}")));
            };
            let envelope = Envelope::new(Payload::MonitorUpdated(monitor.clone()));
            fan_out(&shared, &envelope);
            monitor
        };
        let _ = self.events.send(DirectorEvent::MonitorUpdated {
            monitor: monitor.clone(),
        });
        Ok(monitor)
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    pub async fn list_monitors(&self) -> Vec<VirtualMonitor> {
        self.shared.lock().await.registry.snapshot()
    }

    pub async fn list_clients(&self) -> Vec<ClientInfo> {
        let shared = self.shared.lock().await;
        let mut clients: Vec<ClientInfo> = shared
            .clients
            .iter()
            .map(|(id, handle)| handle.info(id))
            .collect();
        clients.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.client_id.cmp(&b.client_id))
        });
        clients
    }

    /// Oldest-first ring of sent kanpe envelopes.
    pub async fn kanpe_history(&self) -> Vec<Envelope> {
        self.shared.lock().await.history.kanpe()
    }

    /// Oldest-first ring of received feedback envelopes.
    pub async fn feedback_history(&self) -> Vec<Envelope> {
        self.shared.lock().await.history.feedback()
    }

    async fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.shared.lock().await.lifecycle = lifecycle;
    }
}

// ---------------------------------------------------------------------------
// Broadcast helpers
// ---------------------------------------------------------------------------

/// Enqueue one envelope to every Active subscriber. Callers hold the state
/// lock, which is what makes the fan-out order identical for all of them.
pub(crate) fn fan_out(shared: &HubShared, envelope: &Envelope) {
    for handle in shared.clients.values() {
        // Send only fails with zero receivers; the write task holds one for
        // the life of the connection.
        let _ = handle.outbox.send(envelope.clone());
    }
}

fn ensure_running(shared: &HubShared) -> Result<(), HubError> {
    if shared.lifecycle == Lifecycle::Running {
        Ok(())
    } else {
        Err(HubError::NotRunning)
    }
}

/// Validate a target list: non-empty, known IDs only, and the `"ALL"`
/// sentinel collapsing the list to exactly `["ALL"]`.
fn normalize_targets(
    shared: &HubShared,
    targets: Vec<String>,
) -> Result<Vec<String>, HubError> {
    if targets.is_empty() {
        return Err(HubError::InvalidArgument(
            "target_monitor_ids must not be empty".to_owned(),
        ));
    }
    if targets_all(&targets) {
        return Ok(vec![ALL_MONITORS.to_owned()]);
    }
    for id in &targets {
        if !shared.registry.contains(id) {
            return Err(HubError::InvalidArgument(format!(
                "unknown monitor id: {id}"
            )));
        }
    }
    Ok(targets)
}
