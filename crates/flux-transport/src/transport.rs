//! Handshake surface of a peer-to-peer transport.
//!
//! The connection manager drives one [`TransportConnection`] per remote peer
//! through an offer/answer exchange, relaying session descriptions and
//! connectivity candidates over signaling. Everything the transport wants to
//! tell the manager (new local candidates, state changes, opened streams)
//! arrives on the [`TransportEvent`] channel supplied at creation.

use crate::stream::DataStream;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// The stream or connection is closed
    #[error("Connection closed")]
    Closed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A session description could not be parsed or does not match
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    /// An operation required a remote description that has not been set
    #[error("Remote description not set")]
    NoRemoteDescription,

    /// Key agreement or authentication failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Frame exceeds the transport's size limit
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Lifecycle state reported by a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    /// Created, handshake not started
    New,
    /// Handshake in progress
    Connecting,
    /// Stream established
    Connected,
    /// Connectivity lost, may recover
    Disconnected,
    /// Handshake or connectivity failed
    Failed,
    /// Closed for good
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Notifications from a transport connection.
#[derive(Debug)]
pub enum TransportEvent {
    /// A connectivity candidate to forward to the remote peer
    LocalCandidate(String),
    /// The connection changed state
    StateChanged(TransportState),
    /// A data stream is open and ready
    StreamOpened(DataStream),
}

/// Channel on which a connection reports its events.
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Factory for per-peer connections.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create a connection object for `peer_id`. Events are sent on `events`
    /// until the connection is closed.
    async fn create_connection(
        &self,
        peer_id: &str,
        events: TransportEventSender,
    ) -> TransportResult<Box<dyn TransportConnection>>;
}

/// One point-to-point connection, driven through an offer/answer handshake.
///
/// Offering side: `create_data_stream`, `create_offer`, later
/// `set_remote_description(answer)`. Answering side:
/// `set_remote_description(offer)`, `create_answer`. Candidates may be added
/// at any time; those arriving before the remote description are buffered.
#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Request an ordered, reliable data stream with `label`. The stream is
    /// delivered through [`TransportEvent::StreamOpened`] once open.
    fn create_data_stream(&mut self, label: &str) -> TransportResult<()>;

    /// Produce the local offer description.
    async fn create_offer(&mut self) -> TransportResult<String>;

    /// Produce the local answer description for a previously set offer.
    async fn create_answer(&mut self) -> TransportResult<String>;

    /// Apply the remote offer or answer.
    async fn set_remote_description(&mut self, description: &str) -> TransportResult<()>;

    /// Supply a remote connectivity candidate.
    async fn add_candidate(&mut self, candidate: &str) -> TransportResult<()>;

    /// Tear down the connection and any open stream. No further events are
    /// emitted afterwards.
    async fn close(&mut self);
}
