//! Signaling client with automatic reconnection.
//!
//! A single task owns the WebSocket. The cloneable [`SignalingClient`] handle
//! sends it commands; everything the relay says comes back as
//! [`SignalingEvent`]s on the channel returned by [`SignalingClient::new`].

use super::protocol::{ClientMessage, PeerInfo, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Interval, Sleep};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture =
    Pin<Box<dyn Future<Output = Result<WsStream, tokio_tungstenite::tungstenite::Error>> + Send>>;

/// Length of generated peer IDs.
pub const PEER_ID_LEN: usize = 10;

/// Generate a random alphanumeric peer ID.
pub fn random_peer_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PEER_ID_LEN)
        .map(char::from)
        .collect()
}

/// Signaling client configuration
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Relay WebSocket URL (`ws://host:port`)
    pub url: String,
    /// Room code to join
    pub room: String,
    /// Local peer ID
    pub peer_id: String,
    /// Name shown to other room members
    pub display_name: String,
    /// Interval between heartbeats while connected
    pub heartbeat_interval: Duration,
    /// Delay before reconnecting after an unexpected close
    pub reconnect_delay: Duration,
}

impl SignalingConfig {
    /// Configuration with a random peer ID and default timings.
    pub fn new(url: impl Into<String>, room: impl Into<String>) -> Self {
        let peer_id = random_peer_id();
        Self {
            url: url.into(),
            room: room.into(),
            display_name: peer_id.clone(),
            peer_id,
            heartbeat_interval: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(2),
        }
    }

    /// Use a fixed peer ID.
    #[must_use]
    pub fn with_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = peer_id.into();
        self
    }

    /// Set the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }
}

/// Events reported by the signaling client
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Socket opened and `join` sent
    Open,
    /// Socket closed
    Close {
        /// Whether a reconnect is scheduled
        will_reconnect: bool,
    },
    /// Full roster of the room, excluding this peer
    Peers(Vec<PeerInfo>),
    /// A peer entered the room
    PeerJoined(PeerInfo),
    /// A peer left the room
    PeerLeft(String),
    /// Opaque payload from another peer
    Signal {
        /// Sending peer
        from: String,
        /// Receiving peer (this one)
        to: String,
        /// Payload
        data: Value,
    },
    /// Transient error (relay reply, malformed frame, failed connect)
    Error(String),
}

enum Command {
    Connect,
    Disconnect(oneshot::Sender<()>),
    Signal { to: String, data: Value },
}

/// Handle to the signaling task. Cheap to clone; the task stops when every
/// handle is dropped.
#[derive(Clone)]
pub struct SignalingClient {
    peer_id: Arc<str>,
    room: Arc<str>,
    open: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<Command>,
}

impl SignalingClient {
    /// Spawn the signaling task. It stays idle until [`Self::connect`].
    pub fn new(config: SignalingConfig) -> (Self, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let client = Self {
            peer_id: Arc::from(config.peer_id.as_str()),
            room: Arc::from(config.room.as_str()),
            open: Arc::clone(&open),
            commands,
        };
        let actor = SignalingActor {
            config,
            commands: command_rx,
            events,
            open,
            socket: None,
            connecting: None,
            reconnect: None,
            manual: false,
        };
        tokio::spawn(actor.run());
        (client, event_rx)
    }

    /// Local peer ID.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Room code.
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Whether the socket is currently open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Open the socket. No-op while already open or connecting.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Send `leave`, close the socket and stop reconnecting. Resolves once
    /// the socket is closed.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Forward `data` to peer `to` through the relay. Dropped (and logged)
    /// when the socket is not open.
    pub fn send_signal(&self, to: &str, data: Value) {
        let _ = self.commands.send(Command::Signal {
            to: to.to_string(),
            data,
        });
    }
}

struct SignalingActor {
    config: SignalingConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    open: Arc<AtomicBool>,
    socket: Option<WsStream>,
    connecting: Option<ConnectFuture>,
    reconnect: Option<Pin<Box<Sleep>>>,
    manual: bool,
}

/// Await an optional future; pending forever when absent.
async fn maybe<F: Future + Unpin>(future: &mut Option<F>) -> F::Output {
    match future {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(
    socket: &mut Option<WsStream>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match socket {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

impl SignalingActor {
    async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.close_socket(false).await;
                        break;
                    }
                },
                result = maybe(&mut self.connecting) => {
                    self.connecting = None;
                    match result {
                        Ok(ws) => self.opened(ws, &mut heartbeat).await,
                        Err(e) => {
                            warn!("Relay connect to {} failed: {}", self.config.url, e);
                            self.emit(SignalingEvent::Error(e.to_string()));
                            self.closed();
                        }
                    }
                },
                () = maybe(&mut self.reconnect) => {
                    self.reconnect = None;
                    if !self.manual {
                        debug!("Reconnecting to relay {}", self.config.url);
                        self.start_connect();
                    }
                },
                frame = next_frame(&mut self.socket) => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Close(_))) | None => {
                        self.socket = None;
                        self.closed();
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Relay socket error: {}", e);
                        self.socket = None;
                        self.closed();
                    }
                },
                _ = heartbeat.tick(), if self.socket.is_some() => {
                    let message = ClientMessage::Heartbeat {
                        peer_id: self.config.peer_id.clone(),
                    };
                    self.send(&message).await;
                }
            }
        }
        trace!("Signaling task for {} stopped", self.config.peer_id);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                self.manual = false;
                if self.socket.is_none() && self.connecting.is_none() {
                    self.reconnect = None;
                    self.start_connect();
                }
            }
            Command::Disconnect(done) => {
                self.manual = true;
                self.reconnect = None;
                self.connecting = None;
                if self.socket.is_some() {
                    let leave = ClientMessage::Leave {
                        room: self.config.room.clone(),
                        peer_id: self.config.peer_id.clone(),
                    };
                    self.send(&leave).await;
                }
                self.close_socket(true).await;
                let _ = done.send(());
            }
            Command::Signal { to, data } => {
                if self.socket.is_none() {
                    debug!("Relay socket not open; dropping signal to {}", to);
                    return;
                }
                let message = ClientMessage::Signal {
                    room: self.config.room.clone(),
                    from: self.config.peer_id.clone(),
                    to,
                    data,
                };
                self.send(&message).await;
            }
        }
    }

    fn start_connect(&mut self) {
        let url = self.config.url.clone();
        self.connecting = Some(Box::pin(async move {
            connect_async(url.as_str()).await.map(|(ws, _)| ws)
        }));
    }

    async fn opened(&mut self, ws: WsStream, heartbeat: &mut Interval) {
        info!("Connected to relay {}", self.config.url);
        self.socket = Some(ws);
        self.open.store(true, Ordering::SeqCst);
        let join = ClientMessage::Join {
            room: self.config.room.clone(),
            peer_id: self.config.peer_id.clone(),
            display_name: self.config.display_name.clone(),
        };
        self.send(&join).await;
        heartbeat.reset();
        self.emit(SignalingEvent::Open);
    }

    /// The socket is gone (or never opened); schedule a reconnect unless the
    /// close was requested.
    fn closed(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        let will_reconnect = !self.manual;
        if will_reconnect {
            self.reconnect = Some(Box::pin(tokio::time::sleep(self.config.reconnect_delay)));
        }
        self.emit(SignalingEvent::Close { will_reconnect });
    }

    async fn close_socket(&mut self, notify: bool) {
        if let Some(mut ws) = self.socket.take() {
            let _ = ws.close(None).await;
            self.open.store(false, Ordering::SeqCst);
            if notify {
                self.emit(SignalingEvent::Close {
                    will_reconnect: false,
                });
            }
        }
    }

    async fn send(&mut self, message: &ClientMessage) {
        let Some(ws) = self.socket.as_mut() else {
            return;
        };
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode {}: {}", message.message_type(), e);
                return;
            }
        };
        if let Err(e) = ws.send(Message::Text(text)).await {
            debug!("Relay send of {} failed: {}", message.message_type(), e);
        }
    }

    fn handle_text(&mut self, text: &str) {
        let event = match ServerMessage::from_json(text) {
            Ok(ServerMessage::Peers { peers, .. }) => SignalingEvent::Peers(peers),
            Ok(ServerMessage::Signal { from, to, data }) => SignalingEvent::Signal { from, to, data },
            Ok(ServerMessage::PeerJoined { peer }) => SignalingEvent::PeerJoined(peer),
            Ok(ServerMessage::PeerLeft { peer_id }) => SignalingEvent::PeerLeft(peer_id),
            Ok(ServerMessage::Error { message }) => {
                warn!("Relay error: {}", message);
                SignalingEvent::Error(message)
            }
            Err(e) => {
                warn!("Malformed relay frame: {}", e);
                SignalingEvent::Error(e.to_string())
            }
        };
        self.emit(event);
    }

    fn emit(&self, event: SignalingEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::server::{RelayConfig, RelayHandle, RelayServer};
    use serde_json::json;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    async fn start_relay() -> RelayHandle {
        let config = RelayConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..RelayConfig::default()
        };
        RelayServer::bind(config).await.unwrap().spawn()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
        timeout(TEST_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for signaling event")
            .expect("event channel closed")
    }

    async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<SignalingEvent>, mut pred: F) -> SignalingEvent
    where
        F: FnMut(&SignalingEvent) -> bool,
    {
        loop {
            let event = next_event(rx).await;
            if pred(&event) {
                return event;
            }
        }
    }

    fn client(relay: &RelayHandle, peer_id: &str) -> (SignalingClient, mpsc::UnboundedReceiver<SignalingEvent>) {
        let mut config = SignalingConfig::new(relay.url(), "ROOM42")
            .with_peer_id(peer_id)
            .with_display_name(peer_id.to_uppercase());
        config.reconnect_delay = Duration::from_millis(100);
        SignalingClient::new(config)
    }

    #[test]
    fn test_random_peer_id() {
        let id = random_peer_id();
        assert_eq!(id.len(), PEER_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(random_peer_id(), random_peer_id());
    }

    #[tokio::test]
    async fn test_connect_joins_room() {
        let relay = start_relay().await;
        let (alice, mut alice_rx) = client(&relay, "alice");
        alice.connect();
        assert_eq!(next_event(&mut alice_rx).await, SignalingEvent::Open);
        assert_eq!(next_event(&mut alice_rx).await, SignalingEvent::Peers(vec![]));
        assert!(alice.is_open());

        let (bob, mut bob_rx) = client(&relay, "bob");
        bob.connect();
        wait_for(&mut bob_rx, |e| {
            matches!(e, SignalingEvent::Peers(p) if p.len() == 1 && p[0].peer_id == "alice")
        })
        .await;
        let joined = wait_for(&mut alice_rx, |e| matches!(e, SignalingEvent::PeerJoined(_))).await;
        assert_eq!(
            joined,
            SignalingEvent::PeerJoined(PeerInfo::new("bob", "BOB"))
        );
    }

    #[tokio::test]
    async fn test_signal_roundtrip() {
        let relay = start_relay().await;
        let (alice, mut alice_rx) = client(&relay, "alice");
        let (bob, mut bob_rx) = client(&relay, "bob");
        alice.connect();
        wait_for(&mut alice_rx, |e| matches!(e, SignalingEvent::Peers(_))).await;
        bob.connect();
        wait_for(&mut alice_rx, |e| matches!(e, SignalingEvent::PeerJoined(_))).await;

        alice.send_signal("bob", json!({"type": "offer", "sdp": "v=0"}));
        let signal = wait_for(&mut bob_rx, |e| matches!(e, SignalingEvent::Signal { .. })).await;
        assert_eq!(
            signal,
            SignalingEvent::Signal {
                from: "alice".into(),
                to: "bob".into(),
                data: json!({"type": "offer", "sdp": "v=0"}),
            }
        );
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let relay = start_relay().await;
        let (alice, mut alice_rx) = client(&relay, "alice");
        alice.connect();
        alice.connect();
        assert_eq!(next_event(&mut alice_rx).await, SignalingEvent::Open);
        alice.connect();
        tokio::time::sleep(Duration::from_millis(200)).await;
        while let Ok(event) = alice_rx.try_recv() {
            assert_ne!(event, SignalingEvent::Open, "connected twice");
        }
    }

    #[tokio::test]
    async fn test_disconnect_leaves_and_stops_reconnecting() {
        let relay = start_relay().await;
        let (alice, mut alice_rx) = client(&relay, "alice");
        let (bob, mut bob_rx) = client(&relay, "bob");
        alice.connect();
        wait_for(&mut alice_rx, |e| matches!(e, SignalingEvent::Peers(_))).await;
        bob.connect();
        wait_for(&mut alice_rx, |e| matches!(e, SignalingEvent::PeerJoined(_))).await;

        bob.disconnect().await;
        assert!(!bob.is_open());
        wait_for(&mut bob_rx, |e| {
            *e == SignalingEvent::Close {
                will_reconnect: false,
            }
        })
        .await;
        let left = wait_for(&mut alice_rx, |e| matches!(e, SignalingEvent::PeerLeft(_))).await;
        assert_eq!(left, SignalingEvent::PeerLeft("bob".into()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        while let Ok(event) = bob_rx.try_recv() {
            assert_ne!(event, SignalingEvent::Open, "reconnected after manual disconnect");
        }
    }

    #[tokio::test]
    async fn test_reconnects_after_relay_restart() {
        let relay = start_relay().await;
        let addr = relay.local_addr();
        let (alice, mut alice_rx) = client(&relay, "alice");
        alice.connect();
        wait_for(&mut alice_rx, |e| *e == SignalingEvent::Open).await;

        relay.shutdown();
        wait_for(&mut alice_rx, |e| {
            *e == SignalingEvent::Close {
                will_reconnect: true,
            }
        })
        .await;

        let config = RelayConfig {
            bind_addr: addr,
            ..RelayConfig::default()
        };
        let _relay = RelayServer::bind(config).await.unwrap().spawn();
        wait_for(&mut alice_rx, |e| *e == SignalingEvent::Open).await;
        wait_for(&mut alice_rx, |e| matches!(e, SignalingEvent::Peers(_))).await;
    }

    #[tokio::test]
    async fn test_signal_while_closed_is_dropped() {
        let relay = start_relay().await;
        let (alice, _alice_rx) = client(&relay, "alice");
        alice.send_signal("nobody", json!(1));
        alice.disconnect().await;
        assert!(!alice.is_open());
    }
}
