//! Transfer service: one controller per registered peer stream.

use super::TransferConfig;
use super::controller::{ControllerHandle, TransferEnv, spawn_controller};
use super::events::TransferEvent;
use crate::error::TransferError;
use dashmap::DashMap;
use flux_files::{ArchiveUnpacker, CheckpointStore, ChunkSource, SaveTarget};
use flux_transport::DataStream;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Entry point of the transfer engine.
///
/// Bind each peer's data stream with [`register_peer`](Self::register_peer);
/// every session on every peer reports through the single event channel
/// returned by [`new`](Self::new).
///
/// # Examples
///
/// ```no_run
/// use flux_core::{TransferConfig, TransferService};
/// use flux_files::{MemoryCheckpointStore, MemorySource, MemoryTarget};
/// use flux_transport::{StreamConfig, stream_pair};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), flux_core::TransferError> {
/// let (service, mut events) = TransferService::new(
///     TransferConfig::default(),
///     Arc::new(MemoryCheckpointStore::new()),
///     Arc::new(MemoryTarget::new()),
///     None,
/// );
/// let (local, _remote) = stream_pair("file-transfer", StreamConfig::default());
/// service.register_peer("peer-b", local).await;
/// let id = service
///     .send_file("peer-b", Box::new(MemorySource::new("hello.txt", b"hi".to_vec())))
///     .await?;
/// println!("started {id}");
/// # Ok(())
/// # }
/// ```
pub struct TransferService {
    env: Arc<TransferEnv>,
    controllers: DashMap<String, ControllerHandle>,
}

impl TransferService {
    /// Create a service.
    ///
    /// # Arguments
    ///
    /// * `config` - Chunk size, watermarks and checkpoint cadence
    /// * `checkpoints` - Where receive progress is persisted
    /// * `target` - Chooses a sink for each incoming file
    /// * `unpacker` - Optional hook for received folder archives
    pub fn new(
        config: TransferConfig,
        checkpoints: Arc<dyn CheckpointStore>,
        target: Arc<dyn SaveTarget>,
        unpacker: Option<Arc<dyn ArchiveUnpacker>>,
    ) -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let env = Arc::new(TransferEnv {
            config,
            checkpoints,
            target,
            unpacker,
            events,
        });
        (
            Self {
                env,
                controllers: DashMap::new(),
            },
            event_rx,
        )
    }

    /// Engine configuration.
    pub fn config(&self) -> &TransferConfig {
        &self.env.config
    }

    /// Bind `stream` to `peer_id`. A controller already bound to the peer is
    /// shut down; its sessions end with "channel closed".
    pub async fn register_peer(&self, peer_id: &str, stream: DataStream) {
        let handle = spawn_controller(peer_id.to_string(), stream, Arc::clone(&self.env));
        if let Some(previous) = self.controllers.insert(peer_id.to_string(), handle) {
            debug!("Re-binding transfers for {} to a new stream", peer_id);
            previous.shutdown().await;
        }
    }

    /// Unbind `peer_id`, cancelling both directions with "channel closed".
    ///
    /// Returns `false` if the peer was not registered.
    pub async fn unregister_peer(&self, peer_id: &str) -> bool {
        match self.controllers.remove(peer_id) {
            Some((_, handle)) => {
                handle.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Whether a stream is bound for `peer_id`.
    pub fn is_registered(&self, peer_id: &str) -> bool {
        self.controllers.contains_key(peer_id)
    }

    /// Registered peers.
    pub fn peers(&self) -> Vec<String> {
        self.controllers.iter().map(|e| e.key().clone()).collect()
    }

    /// Send `source` to `peer_id` with the configured chunk size.
    ///
    /// Returns the transfer ID once the manifest is on the wire; the outcome
    /// arrives as events.
    ///
    /// # Errors
    ///
    /// * `TransferError::PeerNotRegistered` - no stream for the peer
    /// * `TransferError::SendInProgress` - a send to the peer is active
    /// * `TransferError::InvalidSource` - no valid manifest for the source
    pub async fn send_file(
        &self,
        peer_id: &str,
        source: Box<dyn ChunkSource>,
    ) -> Result<String, TransferError> {
        self.send_file_with_chunk_size(peer_id, source, self.env.config.chunk_size)
            .await
    }

    /// Send `source` to `peer_id` using `chunk_size`-byte chunks.
    ///
    /// # Errors
    ///
    /// Same as [`send_file`](Self::send_file).
    pub async fn send_file_with_chunk_size(
        &self,
        peer_id: &str,
        mut source: Box<dyn ChunkSource>,
        chunk_size: u32,
    ) -> Result<String, TransferError> {
        let client = self.controllers.get(peer_id).map(|c| c.client().clone());
        let Some(client) = client else {
            if let Err(e) = source.dispose().await {
                warn!("Disposing source {} failed: {}", source.info().name, e);
            }
            return Err(TransferError::PeerNotRegistered(peer_id.to_string()));
        };
        client.send_file(source, chunk_size).await
    }

    /// Cancel the send or receive session with `transfer_id` on whichever
    /// peer holds it. The peer is told with a `cancel` frame.
    ///
    /// Returns `false` (and emits nothing) if no such session is active, so
    /// repeated calls are harmless.
    pub async fn cancel_transfer(&self, transfer_id: &str, reason: Option<String>) -> bool {
        let clients: Vec<_> = self
            .controllers
            .iter()
            .map(|c| c.value().client().clone())
            .collect();
        let mut cancelled = false;
        for client in clients {
            cancelled |= client.cancel(transfer_id, reason.clone()).await;
        }
        cancelled
    }

    /// Unregister every peer.
    pub async fn shutdown(&self) {
        for peer_id in self.peers() {
            self.unregister_peer(&peer_id).await;
        }
    }
}
