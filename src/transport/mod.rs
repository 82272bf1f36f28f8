//! Transport module - byte streams and packet framing over them.
//!
//! Provides:
//! - Packet channel over any tokio duplex stream
//! - Target addresses (TCP host:port or local socket path)
//! - Local-socket listener (Unix Domain Sockets)
//! - The per-connection driver task

mod channel;
pub(crate) mod driver;
mod socket;

pub use channel::PacketChannel;
#[cfg(unix)]
pub use socket::LocalServer;
pub use socket::Target;
