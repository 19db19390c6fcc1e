//! Handshake payloads exchanged through the relay.

use flux_signaling::SignalingClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConnectionError;

/// Payload of a relay `signal` frame as produced by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PeerSignal {
    /// Session offer
    Offer {
        /// Transport-specific description
        sdp: String,
    },
    /// Session answer
    Answer {
        /// Transport-specific description
        sdp: String,
    },
    /// Connectivity candidate
    Candidate {
        /// Transport-specific candidate
        candidate: String,
    },
}

impl PeerSignal {
    /// Encode for the relay.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Decode a relayed payload.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::InvalidSignal` if the payload is not a known
    /// signal.
    pub fn from_value(value: Value) -> Result<Self, ConnectionError> {
        serde_json::from_value(value).map_err(|e| ConnectionError::InvalidSignal(e.to_string()))
    }

    /// Signal kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerSignal::Offer { .. } => "offer",
            PeerSignal::Answer { .. } => "answer",
            PeerSignal::Candidate { .. } => "candidate",
        }
    }
}

/// Outbound half of the signaling channel used by the connection manager.
///
/// Delivery is best-effort: implementations drop payloads they cannot send.
pub trait SignalSender: Send + Sync {
    /// Forward `data` to peer `to`.
    fn send_signal(&self, to: &str, data: Value);
}

impl SignalSender for SignalingClient {
    fn send_signal(&self, to: &str, data: Value) {
        SignalingClient::send_signal(self, to, data);
    }
}
