//! Service module - named protocol endpoints multiplexed over a connection.
//!
//! Provides:
//! - [`ServiceHandler`] - callbacks for status changes and incoming messages
//! - [`ServiceClient`] - registers a handler and unregisters it on drop
//! - [`ServiceLink`] - cloneable sending half for use inside handlers
//! - [`inspector`] and [`engine_control`] - two concrete services
//!
//! # Example
//!
//! ```ignore
//! use debug_wire::service::{ServiceClient, ServiceHandler, ServiceStatus};
//!
//! struct Echo;
//!
//! impl ServiceHandler for Echo {
//!     fn message_received(&self, message: bytes::Bytes) {
//!         println!("{} bytes", message.len());
//!     }
//! }
//!
//! let client = ServiceClient::register(&connection, "Echo", Rc::new(Echo))?;
//! if client.status() == ServiceStatus::Enabled {
//!     client.send(b"hi");
//! }
//! ```

mod client;
pub mod engine_control;
pub mod inspector;

use bytes::Bytes;

pub use client::{ServiceClient, ServiceLink};

/// Availability of a service on its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceStatus {
    /// No handshake-complete connection.
    NotConnected,
    /// Connected, but the peer does not offer this service.
    Unavailable,
    /// Connected and the peer offers this service.
    Enabled,
}

/// Callbacks for one registered service.
///
/// Invoked synchronously on the connection's task. Implementations keep
/// their state behind `Cell`/`RefCell` and must not block.
pub trait ServiceHandler {
    /// Called when the derived status changes.
    fn status_changed(&self, status: ServiceStatus) {
        let _ = status;
    }

    /// Called once per message, in arrival order.
    fn message_received(&self, message: Bytes);
}
