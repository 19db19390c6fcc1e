//! Peer connection management.
//!
//! The [`ConnectionManager`] owns at most one transport connection per remote
//! peer and drives it through the offer/answer/candidate handshake, using the
//! signaling relay as the side channel:
//!
//! ```text
//!   local                         relay                         remote
//!     |  connect_to(peer)           |                              |
//!     |--- offer ------------------>|--- offer ------------------->|
//!     |<-- answer ------------------|<-- answer -------------------|
//!     |<-> candidate ... ---------->|<-> candidate ... ----------->|
//!     |=============== direct data stream opens ==================|
//! ```
//!
//! Lifecycle per peer: `new -> connecting -> connected`, then `failed` or
//! `disconnected` on trouble, `closed` on teardown. Failures schedule a
//! bounded number of reconnects; `closed` never does.

mod manager;
mod signal;

pub use manager::ConnectionManager;
pub use signal::{PeerSignal, SignalSender};

use flux_transport::{DataStream, TransportState};
use std::time::Duration;

/// Label of the data stream the manager opens for transfers.
pub const DEFAULT_STREAM_LABEL: &str = "file-transfer";

/// Connection manager configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Delay before a reconnect attempt
    pub reconnect_delay: Duration,
    /// Reconnect attempts allowed between two successful stream opens
    pub max_reconnect_attempts: u32,
    /// Whether failures trigger reconnects at all
    pub reconnect_enabled: bool,
    /// Label for the data stream
    pub stream_label: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(2),
            max_reconnect_attempts: 3,
            reconnect_enabled: true,
            stream_label: DEFAULT_STREAM_LABEL.to_string(),
        }
    }
}

/// Notifications from the connection manager.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A peer's connection changed state
    StateChanged {
        /// Remote peer
        peer_id: String,
        /// New state
        state: TransportState,
    },

    /// A data stream to a peer opened. Every reconnect produces a fresh
    /// stream; consumers must re-bind to it.
    DataChannel {
        /// Remote peer
        peer_id: String,
        /// The open stream
        stream: DataStream,
    },

    /// A peer's connection entry was removed and will not reconnect
    PeerRemoved {
        /// Remote peer
        peer_id: String,
    },
}

impl ConnectionEvent {
    /// Remote peer the event concerns.
    pub fn peer_id(&self) -> &str {
        match self {
            ConnectionEvent::StateChanged { peer_id, .. }
            | ConnectionEvent::DataChannel { peer_id, .. }
            | ConnectionEvent::PeerRemoved { peer_id } => peer_id,
        }
    }
}
