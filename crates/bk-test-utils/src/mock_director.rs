// mock_director: A mock director hub for testing caster sessions.
//
// Accepts connections on ws://127.0.0.1:<port>, validates the client_hello
// handshake, replies with server_welcome + monitor_list_sync, records
// received feedback, and lets tests broadcast envelopes to every connected
// caster.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bk_protocol::{
    ClientHello, Envelope, MonitorListSync, Payload, ServerWelcome, VirtualMonitor,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;

struct MockDirectorState {
    server_name: String,
    monitors: Mutex<Vec<VirtualMonitor>>,
    hellos: Mutex<Vec<ClientHello>>,
    feedback: Mutex<Vec<Envelope>>,
    pongs: Mutex<Vec<Envelope>>,
    feedback_tx: broadcast::Sender<Envelope>,
    broadcast_tx: broadcast::Sender<Envelope>,
    connected: AtomicUsize,
    conn_tasks: Mutex<Vec<tokio::task::AbortHandle>>,
}

/// A mock director for integration testing the caster side.
///
/// # Protocol behavior
///
/// - First message from a client must be `client_hello`; anything else
///   closes the connection.
/// - After a valid hello the server replies `server_welcome` (UUID v4
///   client id) followed by `monitor_list_sync` with the configured
///   monitor list.
/// - `feedback_message` frames are recorded and re-published on the
///   feedback channel for tests to await.
/// - `ping` is answered with a `pong` echoing the envelope id.
pub struct MockDirectorServer {
    addr: SocketAddr,
    state: Arc<MockDirectorState>,
    accept_task: JoinHandle<()>,
}

impl MockDirectorServer {
    /// Start on a random port.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        Self::start_on("127.0.0.1:0").await
    }

    /// Start on a specific address (restart-on-same-port scenarios).
    pub async fn start_on(addr: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        let (feedback_tx, _) = broadcast::channel(64);
        let (broadcast_tx, _) = broadcast::channel(1024);
        let state = Arc::new(MockDirectorState {
            server_name: "Mock Director".to_owned(),
            monitors: Mutex::new(Vec::new()),
            hellos: Mutex::new(Vec::new()),
            feedback: Mutex::new(Vec::new()),
            pongs: Mutex::new(Vec::new()),
            feedback_tx,
            broadcast_tx,
            connected: AtomicUsize::new(0),
            conn_tasks: Mutex::new(Vec::new()),
        });

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let conn_state = accept_state.clone();
                        let task = tokio::spawn(async move {
                            let _ = handle_connection(stream, conn_state).await;
                        });
                        accept_state
                            .conn_tasks
                            .lock()
                            .unwrap()
                            .push(task.abort_handle());
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            addr,
            state,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// URL a caster can dial.
    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Replace the registry snapshot served to future handshakes.
    pub fn set_monitors(&self, monitors: Vec<VirtualMonitor>) {
        *self.state.monitors.lock().unwrap() = monitors;
    }

    /// Broadcast an envelope to every connected caster.
    pub fn broadcast(&self, envelope: Envelope) {
        let _ = self.state.broadcast_tx.send(envelope);
    }

    /// All hellos seen so far, in arrival order.
    pub fn hellos(&self) -> Vec<ClientHello> {
        self.state.hellos.lock().unwrap().clone()
    }

    /// All feedback envelopes received so far.
    pub fn feedback(&self) -> Vec<Envelope> {
        self.state.feedback.lock().unwrap().clone()
    }

    /// All protocol pongs received so far.
    pub fn pongs(&self) -> Vec<Envelope> {
        self.state.pongs.lock().unwrap().clone()
    }

    /// Subscribe before triggering the action under test.
    pub fn subscribe_feedback(&self) -> broadcast::Receiver<Envelope> {
        self.state.feedback_tx.subscribe()
    }

    pub fn connected_clients(&self) -> usize {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Poll until `n` casters have completed the handshake.
    pub async fn wait_for_connections(&self, n: usize, timeout: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.connected_clients() >= n {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        false
    }

    /// Kill the server abruptly, dropping the listener and all connections.
    pub fn abort(self) {
        drop(self);
    }
}

impl Drop for MockDirectorServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        for conn in self.state.conn_tasks.lock().unwrap().drain(..) {
            conn.abort();
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    state: Arc<MockDirectorState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();
    let mut broadcast_rx = state.broadcast_tx.subscribe();

    // Handshake: first frame must be client_hello.
    let hello = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match Envelope::decode(&text) {
                Ok(Envelope {
                    payload: Payload::ClientHello(hello),
                    ..
                }) => break hello,
                _ => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            },
            Some(Ok(Message::Ping(data))) => {
                write.send(Message::Pong(data)).await?;
            }
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
            Some(Err(e)) => return Err(e.into()),
        }
    };
    state.hellos.lock().unwrap().push(hello);

    let welcome = Envelope::new(Payload::ServerWelcome(ServerWelcome {
        server_name: state.server_name.clone(),
        assigned_client_id: format!("c-{}", uuid::Uuid::new_v4()),
    }));
    write.send(Message::Text(welcome.encode()?.into())).await?;
    let sync = Envelope::new(Payload::MonitorListSync(MonitorListSync {
        monitors: state.monitors.lock().unwrap().clone(),
    }));
    write.send(Message::Text(sync.encode()?.into())).await?;
    state.connected.fetch_add(1, Ordering::SeqCst);

    let result = serve_active(&mut write, &mut read, &state, &mut broadcast_rx).await;
    state.connected.fetch_sub(1, Ordering::SeqCst);
    result
}

async fn serve_active<W, R>(
    write: &mut W,
    read: &mut R,
    state: &Arc<MockDirectorState>,
    broadcast_rx: &mut broadcast::Receiver<Envelope>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    W: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        tokio::select! {
            pushed = broadcast_rx.recv() => match pushed {
                Ok(envelope) => {
                    write.send(Message::Text(envelope.encode()?.into())).await?;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(envelope) = Envelope::decode(&text) {
                        match &envelope.payload {
                            Payload::FeedbackMessage(_) => {
                                state.feedback.lock().unwrap().push(envelope.clone());
                                let _ = state.feedback_tx.send(envelope);
                            }
                            Payload::Ping => {
                                let pong = Envelope::with_id(envelope.id.clone(), Payload::Pong);
                                write.send(Message::Text(pong.encode()?.into())).await?;
                            }
                            Payload::Pong => {
                                state.pongs.lock().unwrap().push(envelope.clone());
                            }
                            _ => {}
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    write.send(Message::Pong(data.clone())).await?;
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}
