//! Relay protocol message definitions.
//!
//! Every frame is a JSON object with a `type` discriminator. Field names are
//! camelCase on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A room member as seen by other members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Peer identifier
    pub peer_id: String,
    /// Human-readable name
    pub display_name: String,
}

impl PeerInfo {
    /// Create a peer entry.
    pub fn new(peer_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Messages sent by clients to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Enter a room
    #[serde(rename_all = "camelCase")]
    Join {
        /// Room code
        room: String,
        /// Joining peer
        peer_id: String,
        /// Name shown to other members
        display_name: String,
    },

    /// Forward an opaque payload to another member
    Signal {
        /// Room code
        room: String,
        /// Sending peer
        from: String,
        /// Receiving peer
        to: String,
        /// Opaque handshake payload
        data: Value,
    },

    /// Leave a room
    #[serde(rename_all = "camelCase")]
    Leave {
        /// Room code
        room: String,
        /// Leaving peer
        peer_id: String,
    },

    /// Liveness refresh
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        /// Peer sending the heartbeat
        peer_id: String,
    },
}

/// Messages sent by the relay to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Room roster, excluding the recipient
    Peers {
        /// Room code
        room: String,
        /// Other members
        peers: Vec<PeerInfo>,
    },

    /// Forwarded signal
    Signal {
        /// Sending peer
        from: String,
        /// Receiving peer
        to: String,
        /// Opaque handshake payload
        data: Value,
    },

    /// A peer entered the room
    PeerJoined {
        /// The new member
        peer: PeerInfo,
    },

    /// A peer left the room
    #[serde(rename_all = "camelCase")]
    PeerLeft {
        /// The departed member
        peer_id: String,
    },

    /// Rejected frame
    Error {
        /// Human-readable reason
        message: String,
    },
}

impl ClientMessage {
    /// Encode as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Serialization` if encoding fails.
    pub fn to_json(&self) -> Result<String, RelayError> {
        serde_json::to_string(self).map_err(|e| RelayError::Serialization(e.to_string()))
    }

    /// Decode a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidMessage` for malformed or unknown frames.
    pub fn from_json(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(|e| RelayError::InvalidMessage(e.to_string()))
    }

    /// Get the message type name
    pub fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Signal { .. } => "signal",
            ClientMessage::Leave { .. } => "leave",
            ClientMessage::Heartbeat { .. } => "heartbeat",
        }
    }
}

impl ServerMessage {
    /// Encode as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Serialization` if encoding fails.
    pub fn to_json(&self) -> Result<String, RelayError> {
        serde_json::to_string(self).map_err(|e| RelayError::Serialization(e.to_string()))
    }

    /// Decode a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidMessage` for malformed or unknown frames.
    pub fn from_json(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(|e| RelayError::InvalidMessage(e.to_string()))
    }

    /// Build an error reply.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Malformed or unknown frame
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The socket is not open
    #[error("Not connected to relay")]
    NotConnected,

    /// The client or server has shut down
    #[error("Relay closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RelayError::WebSocket(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_wire_format() {
        let msg = ClientMessage::Join {
            room: "ABC123".into(),
            peer_id: "p1".into(),
            display_name: "Alice".into(),
        };
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "join", "room": "ABC123", "peerId": "p1", "displayName": "Alice"})
        );
    }

    #[test]
    fn test_heartbeat_and_leave_decode() {
        assert_eq!(
            ClientMessage::from_json(r#"{"type":"heartbeat","peerId":"p1"}"#).unwrap(),
            ClientMessage::Heartbeat {
                peer_id: "p1".into()
            }
        );
        assert_eq!(
            ClientMessage::from_json(r#"{"type":"leave","room":"R","peerId":"p1"}"#).unwrap(),
            ClientMessage::Leave {
                room: "R".into(),
                peer_id: "p1".into()
            }
        );
    }

    #[test]
    fn test_signal_data_is_opaque() {
        let raw = r#"{"type":"signal","room":"R","from":"a","to":"b","data":{"type":"offer","sdp":"x","extra":[1,2]}}"#;
        let msg = ClientMessage::from_json(raw).unwrap();
        let ClientMessage::Signal { data, .. } = msg else {
            panic!("expected signal");
        };
        assert_eq!(data, json!({"type": "offer", "sdp": "x", "extra": [1, 2]}));
    }

    #[test]
    fn test_server_message_wire_format() {
        let joined = ServerMessage::PeerJoined {
            peer: PeerInfo::new("p2", "Bob"),
        };
        let value: Value = serde_json::from_str(&joined.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "peer-joined", "peer": {"peerId": "p2", "displayName": "Bob"}})
        );

        let left = ServerMessage::PeerLeft {
            peer_id: "p2".into(),
        };
        let value: Value = serde_json::from_str(&left.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "peer-left", "peerId": "p2"}));
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(matches!(
            ClientMessage::from_json("not json"),
            Err(RelayError::InvalidMessage(_))
        ));
        assert!(ClientMessage::from_json(r#"{"type":"dance"}"#).is_err());
        assert!(ClientMessage::from_json(r#"{"type":"join","room":"R"}"#).is_err());
    }

    #[test]
    fn test_message_type_names() {
        let msg = ClientMessage::Heartbeat {
            peer_id: "p".into(),
        };
        assert_eq!(msg.message_type(), "heartbeat");
    }
}
