//! Byte channels between the log daemon, its producers and its consumers.
//!
//! This is the lowest layer of dltrelay. It knows nothing about message
//! framing; it only hands out connected [`IpcStream`]s:
//! - Unix domain sockets for local producers and consumers
//! - TCP for remote consumers
//!
//! Every accepted connection is tagged with a [`ConnectionId`] drawn from a
//! monotonically increasing counter, so a closed connection's id is never
//! handed out again.

pub mod connection;
pub mod endpoint;
pub mod error;
pub mod tcp;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use connection::{ConnectionId, ConnectionIds};
pub use endpoint::{Endpoint, Listener};
pub use error::{Result, TransportError};
pub use tcp::TcpSocket;
pub use traits::IpcStream;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
