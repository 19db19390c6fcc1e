//! Error types for the FluxShare core

use flux_signaling::RelayError;
use flux_transport::TransportError;
use thiserror::Error;

/// Errors surfaced by [`crate::FluxNode`] operations
#[derive(Debug, Error)]
pub enum NodeError {
    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Signaling relay operation failed
    #[error("Signaling error: {0}")]
    Signaling(#[from] RelayError),

    /// Transfer operation failed
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Connection management failed
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// File I/O error
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Synchronous rejections from the transfer engine.
///
/// Failures that happen after a transfer has started are reported as
/// [`crate::TransferEvent::Error`] instead.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A send session is already running on this peer
    #[error("a send to peer {0} is already in progress")]
    SendInProgress(String),

    /// No data stream is registered for the peer
    #[error("no data stream registered for peer {0}")]
    PeerNotRegistered(String),

    /// The source cannot be described by a valid manifest
    #[error("invalid source: {0}")]
    InvalidSource(String),

    /// A received or constructed manifest is inconsistent
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Control frame could not be decoded
    #[error("invalid control frame: {0}")]
    InvalidFrame(String),

    /// The data stream rejected a frame
    #[error("stream error: {0}")]
    Stream(#[from] TransportError),

    /// The peer controller task has stopped
    #[error("transfer controller for peer {0} has stopped")]
    ControllerStopped(String),
}

/// Connection manager errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The manager task has stopped
    #[error("connection manager has stopped")]
    ManagerStopped,

    /// Signal payload could not be decoded
    #[error("invalid signal payload: {0}")]
    InvalidSignal(String),

    /// Transport negotiation failed
    #[error("negotiation with peer {peer_id} failed: {source}")]
    Negotiation {
        /// Remote peer
        peer_id: String,
        /// Underlying transport error
        #[source]
        source: TransportError,
    },
}

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NodeError::Transfer(TransferError::SendInProgress("p1".into()));
        assert_eq!(
            err.to_string(),
            "Transfer error: a send to peer p1 is already in progress"
        );

        let err = ConnectionError::Negotiation {
            peer_id: "p2".into(),
            source: TransportError::NoRemoteDescription,
        };
        assert!(err.to_string().starts_with("negotiation with peer p2 failed"));
    }

    #[test]
    fn test_transport_error_converts() {
        let err: NodeError = TransportError::Closed.into();
        assert!(matches!(err, NodeError::Transport(TransportError::Closed)));
    }
}
