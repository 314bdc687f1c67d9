//! TCPROS/RPCROS connection engine: header handshake, framing, and the
//! per-connection state machines for a ROS-style pub/sub and service-call
//! transport (spec §1-§2).
//!
//! - [`wire`] — the frame codec: length-prefixed primitives shared by both
//!   protocols.
//! - [`header`] — the field vocabulary, parsing, and the handshake matcher.
//! - [`conn`] — the four per-role connection state machines.
//! - [`node`] — the coordinator: registries, connection pools, poll loop.
//! - [`error`] — the crate's error families.
//! - [`time`] — the monotonic clock and periodic-tick helper.

#[macro_use]
mod assert;

pub mod conn;
pub mod error;
pub mod header;
pub mod node;
pub mod registry;
pub mod time;
pub mod wire;

pub use error::{CallbackError, ConnError, Error, HandshakeError, Result, WireError};
pub use node::{MatchStrictness, Node, NodeConfig};
pub use registry::Index;
