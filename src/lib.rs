//! # debug-wire
//!
//! Transport for attaching inspection tooling to a running interpreter.
//!
//! One physical connection (TCP or a local socket) carries any number of
//! named services. The tooling side sends a hello listing its services, the
//! debuggee answers with the services it offers, and from then on packets
//! are routed to handlers by service name.
//!
//! ## Architecture
//!
//! - **Framing** ([`protocol`], [`transport::PacketChannel`]): `u32`
//!   little-endian length prefix, including itself, then the packet body
//! - **Connection** ([`DebugConnection`]): handshake, service registries,
//!   multiplexing, teardown
//! - **Services** ([`service`]): handlers with status and message callbacks
//! - **Manager** ([`ConnectionManager`]): target selection and bounded retries
//!
//! Everything runs on one thread: use a current-thread runtime and a
//! `tokio::task::LocalSet`.
//!
//! ## Example
//!
//! ```ignore
//! use debug_wire::{ConnectionManager, ManagerConfig, ManagerEvent};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let local = tokio::task::LocalSet::new();
//!     local
//!         .run_until(async {
//!             let mut manager = ConnectionManager::new(ManagerConfig::default());
//!             manager.connect("tcp://127.0.0.1:3768".parse().unwrap());
//!
//!             while let Some(event) = manager.next_event().await {
//!                 println!("{:?}", event);
//!             }
//!         })
//!         .await;
//! }
//! ```

pub mod connection;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod service;
pub mod transport;

pub use connection::{ConnectionConfig, ConnectionEvent, DebugConnection};
pub use error::{DebugWireError, Result};
pub use manager::{ConnectionHooks, ConnectionManager, ManagerConfig, ManagerEvent, ManagerState};
pub use service::{ServiceClient, ServiceHandler, ServiceLink, ServiceStatus};
pub use transport::Target;
