//! # FluxShare Core
//!
//! Session engine for FluxShare peer-to-peer file transfer.
//!
//! This crate provides:
//! - A connection manager that negotiates one direct data stream per remote
//!   peer through the signaling relay, with bounded reconnection
//! - The chunked transfer engine: manifests, control frames, backpressure-aware
//!   sending and checkpointed, resumable receiving
//! - [`FluxNode`], which wires the signaling client, the connection manager
//!   and the transfer engine together
//!
//! # Example
//!
//! ```no_run
//! use flux_core::{FluxNode, NodeConfig};
//! use flux_files::{DirectoryTarget, MemoryCheckpointStore};
//! use flux_signaling::SignalingConfig;
//! use flux_transport::TcpTransport;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = TcpTransport::bind("0.0.0.0:0".parse::<std::net::SocketAddr>()?).await?;
//! let config = NodeConfig::new(SignalingConfig::new("ws://127.0.0.1:4000", "ROOM42"));
//! let (node, mut events) = FluxNode::start(
//!     config,
//!     Arc::new(transport),
//!     Arc::new(MemoryCheckpointStore::new()),
//!     Arc::new(DirectoryTarget::new("downloads")),
//! );
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! node.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod error;
pub mod node;
pub mod transfer;

pub use connection::{
    ConnectionConfig, ConnectionEvent, ConnectionManager, PeerSignal, SignalSender,
};
pub use error::{ConnectionError, NodeError, Result, TransferError};
pub use node::{FluxNode, NodeConfig, NodeEvent};
pub use transfer::{
    ControlMessage, Direction, Manifest, TransferConfig, TransferContext, TransferEvent,
    TransferService,
};
