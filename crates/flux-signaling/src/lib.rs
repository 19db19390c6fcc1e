//! # FluxShare Signaling
//!
//! Rendezvous for FluxShare peers.
//!
//! This crate provides:
//! - The relay wire protocol (JSON frames over WebSocket)
//! - A room registry that tracks membership, heartbeats and last-writer-wins
//!   rejoins as a pure state machine
//! - The relay server owning the sockets and the heartbeat sweep
//! - A signaling client that reconnects on its own and reports typed events
//!
//! The relay never inspects signal payloads and holds no transfer state.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod relay;

pub use relay::client::{SignalingClient, SignalingConfig, SignalingEvent};
pub use relay::protocol::{ClientMessage, PeerInfo, RelayError, ServerMessage};
pub use relay::rooms::{ConnectionId, Delivery, RoomRegistry};
pub use relay::server::{RelayConfig, RelayHandle, RelayServer};
