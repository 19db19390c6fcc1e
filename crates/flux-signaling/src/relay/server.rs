//! WebSocket relay server.
//!
//! One task per client socket reads frames and applies them to the shared
//! [`RoomRegistry`]; a writer task per socket drains that socket's outbound
//! queue. A sweep task force-leaves peers whose heartbeats stopped.

use super::protocol::{ClientMessage, RelayError, ServerMessage};
use super::rooms::{ConnectionId, Delivery, RoomRegistry};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

/// Port used when `PORT` is unset or invalid.
pub const DEFAULT_PORT: u16 = 4000;

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address
    pub bind_addr: SocketAddr,
    /// Peers silent for longer than this are removed
    pub heartbeat_timeout: Duration,
    /// How often the heartbeat sweep runs
    pub sweep_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            heartbeat_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    /// Defaults with the port taken from the `PORT` environment variable.
    pub fn from_env() -> Self {
        let port = resolve_port(std::env::var("PORT").ok().as_deref());
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            ..Self::default()
        }
    }
}

/// Interpret a `PORT` value, falling back to [`DEFAULT_PORT`] with a warning
/// when it is not a positive port number.
pub fn resolve_port(raw: Option<&str>) -> u16 {
    let Some(raw) = raw else {
        return DEFAULT_PORT;
    };
    match raw.trim().parse::<u16>() {
        Ok(port) if port > 0 => port,
        _ => {
            warn!(
                "Invalid PORT value {:?}; falling back to {}",
                raw, DEFAULT_PORT
            );
            DEFAULT_PORT
        }
    }
}

enum Outbound {
    Message(String),
    Close,
}

#[derive(Default)]
struct RelayState {
    registry: RoomRegistry,
    connections: HashMap<ConnectionId, mpsc::UnboundedSender<Outbound>>,
    next_id: ConnectionId,
}

impl RelayState {
    fn dispatch(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            match delivery {
                Delivery::Send {
                    connection,
                    message,
                } => self.send(connection, &message),
                Delivery::Terminate { connection } => {
                    if let Some(tx) = self.connections.get(&connection) {
                        let _ = tx.send(Outbound::Close);
                    }
                }
            }
        }
    }

    fn send(&self, connection: ConnectionId, message: &ServerMessage) {
        let Some(tx) = self.connections.get(&connection) else {
            trace!("Connection {} gone; dropping frame", connection);
            return;
        };
        match message.to_json() {
            Ok(text) => {
                let _ = tx.send(Outbound::Message(text));
            }
            Err(e) => warn!("Failed to encode relay frame: {}", e),
        }
    }
}

type SharedState = Arc<Mutex<RelayState>>;

/// Room-based signaling relay.
///
/// # Examples
///
/// ```no_run
/// use flux_signaling::{RelayConfig, RelayServer};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let server = RelayServer::bind(RelayConfig::from_env()).await?;
/// println!("Relay listening on {}", server.local_addr());
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct RelayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: RelayConfig,
    state: SharedState,
}

impl RelayServer {
    /// Bind the relay's listener.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Io` if the address cannot be bound.
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            config,
            state: Arc::new(Mutex::new(RelayState::default())),
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until the task is dropped. Connection and sweep tasks are
    /// owned by this future and stop with it.
    ///
    /// # Errors
    ///
    /// Currently never returns an error; accept failures are logged and
    /// retried.
    pub async fn run(self) -> Result<(), RelayError> {
        info!("Relay listening on ws://{}", self.local_addr);
        let mut tasks = JoinSet::new();
        tasks.spawn(sweep_loop(Arc::clone(&self.state), self.config.clone()));

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        let id = {
                            let mut state = self.state.lock().await;
                            state.next_id += 1;
                            state.next_id
                        };
                        tasks.spawn(serve_connection(Arc::clone(&self.state), id, socket, addr));
                    }
                    Err(e) => {
                        warn!("Relay accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }
    }

    /// Run on a background task.
    pub fn spawn(self) -> RelayHandle {
        let local_addr = self.local_addr;
        let task = tokio::spawn(async move {
            if let Err(e) = self.run().await {
                warn!("Relay stopped: {}", e);
            }
        });
        RelayHandle { local_addr, task }
    }
}

/// Handle to a relay running on a background task. Dropping it stops the
/// relay.
pub struct RelayHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL clients on this host can use.
    pub fn url(&self) -> String {
        let port = self.local_addr.port();
        if self.local_addr.ip().is_unspecified() {
            format!("ws://127.0.0.1:{port}")
        } else {
            format!("ws://{}", self.local_addr)
        }
    }

    /// Stop the relay and close every client socket.
    pub fn shutdown(self) {
        self.task.abort();
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn sweep_loop(state: SharedState, config: RelayConfig) {
    let mut ticker = tokio::time::interval(config.sweep_interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let mut guard = state.lock().await;
        let deliveries = guard
            .registry
            .sweep(Instant::now().into_std(), config.heartbeat_timeout);
        guard.dispatch(deliveries);
    }
}

async fn serve_connection(state: SharedState, id: ConnectionId, socket: TcpStream, addr: SocketAddr) {
    let ws = match accept_async(socket).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };
    debug!("Client {} connected as connection {}", addr, id);

    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    state.lock().await.connections.insert(id, tx);

    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Message(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_text(&state, id, &text).await,
            Ok(Message::Binary(_)) => {
                state
                    .lock()
                    .await
                    .send(id, &ServerMessage::error("binary frames are not supported"));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Connection {} read error: {}", id, e);
                break;
            }
        }
    }

    {
        let mut state = state.lock().await;
        state.connections.remove(&id);
        let deliveries = state.registry.connection_closed(id);
        state.dispatch(deliveries);
    }
    writer.abort();
    debug!("Connection {} ({}) closed", id, addr);
}

async fn handle_text(state: &SharedState, id: ConnectionId, text: &str) {
    let mut state = state.lock().await;
    let message = match ClientMessage::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            debug!("Connection {} sent a malformed frame: {}", id, e);
            state.send(id, &ServerMessage::error(e.to_string()));
            return;
        }
    };
    trace!("Connection {} -> {}", id, message.message_type());

    let now = Instant::now().into_std();
    let deliveries = match message {
        ClientMessage::Join {
            room,
            peer_id,
            display_name,
        } => state.registry.join(id, &room, &peer_id, &display_name, now),
        ClientMessage::Signal {
            room,
            from,
            to,
            data,
        } => state.registry.signal(&room, &from, &to, data),
        ClientMessage::Leave { room, peer_id } => state.registry.leave(id, &room, &peer_id),
        ClientMessage::Heartbeat { peer_id } => {
            state.registry.heartbeat(id, &peer_id, now);
            Vec::new()
        }
    };
    state.dispatch(deliveries);
}
