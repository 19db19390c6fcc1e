//! # FluxShare Transport
//!
//! Direct peer data streams for FluxShare.
//!
//! This crate provides:
//! - `DataStream`: an ordered, reliable, message-oriented stream carrying text
//!   and binary frames, with buffered-amount tracking for backpressure
//! - `PeerTransport` / `TransportConnection`: the offer/answer/candidate
//!   handshake surface the connection manager drives
//! - A loopback transport for in-process peers and tests
//! - A direct TCP transport with X25519 key agreement and ChaCha20-Poly1305
//!   framed encryption

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod loopback;
pub mod secure;
pub mod stream;
pub mod tcp;
pub mod transport;

pub use loopback::{LoopbackHub, LoopbackTransport, stream_pair};
pub use stream::{DataStream, Frame, StreamCloser, StreamConfig, StreamIo, StreamReceiver, StreamSender};
pub use tcp::TcpTransport;
pub use transport::{
    PeerTransport, TransportConnection, TransportError, TransportEvent, TransportEventSender,
    TransportResult, TransportState,
};
