//! Node wiring: signaling client, connection manager and transfer engine.
//!
//! ```text
//!   relay ──► SignalingClient ──signal──► ConnectionManager ──stream──► TransferService
//!                  │                            │                            │
//!                  └────────────── NodeEvent channel (one per node) ◄────────┘
//! ```
//!
//! The wiring task is the only consumer of the three component event
//! channels. A data stream that opens is bound to the transfer engine; a
//! connection that fails, drops or is removed unbinds it, which ends that
//! peer's sessions with "channel closed".

use crate::connection::{ConnectionConfig, ConnectionEvent, ConnectionManager, SignalSender};
use crate::error::Result;
use crate::transfer::{TransferConfig, TransferEvent, TransferService};
use flux_files::{ArchiveUnpacker, CheckpointStore, ChunkSource, FileSource, SaveTarget};
use flux_signaling::{SignalingClient, SignalingConfig, SignalingEvent};
use flux_transport::{PeerTransport, TransportState};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration of a [`FluxNode`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Relay URL, room and identity
    pub signaling: SignalingConfig,
    /// Reconnect policy
    pub connection: ConnectionConfig,
    /// Chunking and backpressure
    pub transfer: TransferConfig,
    /// Open connections to roster members automatically. The peer with the
    /// smaller ID makes the offer.
    pub auto_connect: bool,
}

impl NodeConfig {
    /// Defaults for everything but signaling.
    pub fn new(signaling: SignalingConfig) -> Self {
        Self {
            signaling,
            connection: ConnectionConfig::default(),
            transfer: TransferConfig::default(),
            auto_connect: true,
        }
    }
}

/// Everything a node reports.
#[derive(Debug)]
pub enum NodeEvent {
    /// Relay lifecycle and roster updates. Handshake signals are consumed
    /// internally and never surface here.
    Signaling(SignalingEvent),
    /// A peer connection changed state
    ConnectionState {
        /// Remote peer
        peer_id: String,
        /// New state
        state: TransportState,
    },
    /// A data stream to the peer is bound and files can be sent
    PeerReady(String),
    /// The peer connection is gone for good
    PeerRemoved(String),
    /// Transfer lifecycle
    Transfer(TransferEvent),
}

/// A running FluxShare peer.
pub struct FluxNode {
    signaling: SignalingClient,
    connections: ConnectionManager,
    transfers: Arc<TransferService>,
    task: JoinHandle<()>,
}

impl FluxNode {
    /// Start a node and connect to the relay.
    ///
    /// Received archives are kept as files; use
    /// [`start_with_unpacker`](Self::start_with_unpacker) to expand them.
    pub fn start(
        config: NodeConfig,
        transport: Arc<dyn PeerTransport>,
        checkpoints: Arc<dyn CheckpointStore>,
        target: Arc<dyn SaveTarget>,
    ) -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        Self::start_with_unpacker(config, transport, checkpoints, target, None)
    }

    /// Start a node whose received folder archives go through `unpacker`.
    pub fn start_with_unpacker(
        config: NodeConfig,
        transport: Arc<dyn PeerTransport>,
        checkpoints: Arc<dyn CheckpointStore>,
        target: Arc<dyn SaveTarget>,
        unpacker: Option<Arc<dyn ArchiveUnpacker>>,
    ) -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let (signaling, signaling_rx) = SignalingClient::new(config.signaling);
        let signals: Arc<dyn SignalSender> = Arc::new(signaling.clone());
        let (connections, connection_rx) = ConnectionManager::new(
            signaling.peer_id(),
            transport,
            signals,
            config.connection,
        );
        let (transfers, transfer_rx) =
            TransferService::new(config.transfer, checkpoints, target, unpacker);
        let transfers = Arc::new(transfers);
        let (events, event_rx) = mpsc::unbounded_channel();

        let wiring = Wiring {
            local_id: signaling.peer_id().to_string(),
            auto_connect: config.auto_connect,
            connections: connections.clone(),
            transfers: Arc::clone(&transfers),
            events,
        };
        let task = tokio::spawn(wiring.run(signaling_rx, connection_rx, transfer_rx));

        info!(
            "Node {} joining room {}",
            signaling.peer_id(),
            signaling.room()
        );
        signaling.connect();

        (
            Self {
                signaling,
                connections,
                transfers,
                task,
            },
            event_rx,
        )
    }

    /// This node's relay ID.
    pub fn peer_id(&self) -> &str {
        self.signaling.peer_id()
    }

    /// Room this node joined.
    pub fn room(&self) -> &str {
        self.signaling.room()
    }

    /// Open (or re-open) a connection to `peer_id`.
    pub fn connect_to(&self, peer_id: &str) {
        self.connections.connect_to(peer_id);
    }

    /// Peers with a bound data stream.
    pub fn ready_peers(&self) -> Vec<String> {
        self.transfers.peers()
    }

    /// Send `source` to a ready peer. Returns the transfer ID.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Transfer` when the engine rejects the send.
    pub async fn send_file(&self, peer_id: &str, source: Box<dyn ChunkSource>) -> Result<String> {
        Ok(self.transfers.send_file(peer_id, source).await?)
    }

    /// Send the file at `path` to a ready peer.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Io` if the file cannot be opened, otherwise as
    /// [`send_file`](Self::send_file).
    pub async fn send_path(&self, peer_id: &str, path: impl AsRef<Path>) -> Result<String> {
        let source = FileSource::open(path.as_ref()).await?;
        self.send_file(peer_id, Box::new(source)).await
    }

    /// Cancel a transfer in either direction. Repeated calls are no-ops.
    pub async fn cancel_transfer(&self, transfer_id: &str, reason: Option<String>) -> bool {
        self.transfers.cancel_transfer(transfer_id, reason).await
    }

    /// Close the connection to `peer_id` without reconnecting.
    pub async fn disconnect(&self, peer_id: &str) {
        self.transfers.unregister_peer(peer_id).await;
        self.connections.disconnect(peer_id).await;
    }

    /// Stop everything: sessions end, connections close and the relay
    /// sees a `leave`.
    ///
    /// # Errors
    ///
    /// Currently infallible; the result leaves room for transports whose
    /// teardown can fail.
    pub async fn shutdown(self) -> Result<()> {
        self.task.abort();
        self.transfers.shutdown().await;
        self.connections.dispose().await;
        self.signaling.disconnect().await;
        debug!("Node {} stopped", self.signaling.peer_id());
        Ok(())
    }
}

struct Wiring {
    local_id: String,
    auto_connect: bool,
    connections: ConnectionManager,
    transfers: Arc<TransferService>,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl Wiring {
    async fn run(
        self,
        mut signaling: mpsc::UnboundedReceiver<SignalingEvent>,
        mut connections: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut transfers: mpsc::UnboundedReceiver<TransferEvent>,
    ) {
        loop {
            tokio::select! {
                Some(event) = signaling.recv() => self.on_signaling(event),
                Some(event) = connections.recv() => self.on_connection(event).await,
                Some(event) = transfers.recv() => self.emit(NodeEvent::Transfer(event)),
                else => break,
            }
        }
        debug!("Node wiring for {} stopped", self.local_id);
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    fn on_signaling(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::Signal { from, data, .. } => {
                self.connections.handle_signal(&from, data);
            }
            SignalingEvent::Peers(ref peers) if self.auto_connect => {
                for peer in peers.iter().filter(|p| self.local_id < p.peer_id) {
                    debug!("Auto-connecting to {}", peer.peer_id);
                    self.connections.connect_to(&peer.peer_id);
                }
                self.emit(NodeEvent::Signaling(event));
            }
            other => self.emit(NodeEvent::Signaling(other)),
        }
    }

    async fn on_connection(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::DataChannel { peer_id, stream } => {
                self.transfers.register_peer(&peer_id, stream).await;
                info!("Data stream to {} ready", peer_id);
                self.emit(NodeEvent::PeerReady(peer_id));
            }
            ConnectionEvent::StateChanged { peer_id, state } => {
                if matches!(state, TransportState::Failed | TransportState::Disconnected) {
                    warn!("Connection to {} {}; ending its transfers", peer_id, state);
                    self.transfers.unregister_peer(&peer_id).await;
                }
                self.emit(NodeEvent::ConnectionState { peer_id, state });
            }
            ConnectionEvent::PeerRemoved { peer_id } => {
                self.transfers.unregister_peer(&peer_id).await;
                self.emit(NodeEvent::PeerRemoved(peer_id));
            }
        }
    }
}
