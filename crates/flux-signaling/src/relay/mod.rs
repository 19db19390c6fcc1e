//! Relay protocol, room registry, server and client.

pub mod client;
pub mod protocol;
pub mod rooms;
pub mod server;
