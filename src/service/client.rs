//! Service registration handle and link.

use std::rc::Rc;

use crate::connection::{DebugConnection, WeakConnection};
use crate::error::Result;

use super::{ServiceHandler, ServiceStatus};

/// Sending half of a registered service.
///
/// Holds only a weak reference to the connection, so a handler may keep a
/// link without creating a cycle.
#[derive(Clone)]
pub struct ServiceLink {
    name: Rc<str>,
    connection: WeakConnection,
}

impl ServiceLink {
    pub fn new(connection: &DebugConnection, name: &str) -> Self {
        Self {
            name: Rc::from(name),
            connection: connection.downgrade(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> Option<DebugConnection> {
        self.connection.upgrade()
    }

    /// Current status; `NotConnected` once the connection is gone.
    pub fn status(&self) -> ServiceStatus {
        self.connection()
            .map(|connection| connection.service_status(&self.name))
            .unwrap_or(ServiceStatus::NotConnected)
    }

    /// Version the peer reported for this service.
    pub fn service_version(&self) -> Option<f32> {
        self.connection()?.service_version(&self.name)
    }

    /// Send one message. Dropped unless the service is enabled.
    pub fn send(&self, message: &[u8]) -> bool {
        let Some(connection) = self.connection() else {
            tracing::debug!("Service {} has no connection, dropping message", self.name);
            return false;
        };

        let sent = connection.send_message(&self.name, message);
        if !sent {
            tracing::debug!("Service {} not enabled, dropping message", self.name);
        }
        sent
    }
}

/// Registered service. Unregisters from the connection on drop.
pub struct ServiceClient {
    link: ServiceLink,
}

impl ServiceClient {
    /// Register `handler` under `name`.
    ///
    /// # Errors
    ///
    /// Fails if a service with the same name is already registered.
    pub fn register(
        connection: &DebugConnection,
        name: &str,
        handler: Rc<dyn ServiceHandler>,
    ) -> Result<Self> {
        connection.register_service(name, handler)?;
        Ok(Self {
            link: ServiceLink::new(connection, name),
        })
    }

    pub fn link(&self) -> &ServiceLink {
        &self.link
    }

    pub fn name(&self) -> &str {
        self.link.name()
    }

    pub fn status(&self) -> ServiceStatus {
        self.link.status()
    }

    pub fn service_version(&self) -> Option<f32> {
        self.link.service_version()
    }

    pub fn send(&self, message: &[u8]) -> bool {
        self.link.send(message)
    }
}

impl Drop for ServiceClient {
    fn drop(&mut self) {
        if let Some(connection) = self.link.connection() {
            connection.unregister_service(self.link.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{drain_outbound, open_connection, peer_hello, Recorder};
    use crate::error::DebugWireError;

    #[test]
    fn test_status_follows_connection() {
        let (connection, _events) = open_connection();
        let client =
            ServiceClient::register(&connection, "X", Rc::new(Recorder::default())).unwrap();
        assert_eq!(client.status(), ServiceStatus::NotConnected);

        connection.receive_frame(peer_hello(&["X"]));
        assert_eq!(client.status(), ServiceStatus::Enabled);
        assert_eq!(client.service_version(), Some(1.0));

        drop(connection);
        assert_eq!(client.status(), ServiceStatus::NotConnected);
        assert!(!client.send(b"gone"));
    }

    #[test]
    fn test_send_only_when_enabled() {
        let (connection, _events) = open_connection();
        let client =
            ServiceClient::register(&connection, "X", Rc::new(Recorder::default())).unwrap();
        assert!(!client.send(b"early"));

        connection.receive_frame(peer_hello(&["Y"]));
        assert_eq!(client.status(), ServiceStatus::Unavailable);
        assert!(!client.send(b"unavailable"));
    }

    #[test]
    fn test_drop_unregisters() {
        let (connection, _events) = open_connection();
        let client =
            ServiceClient::register(&connection, "X", Rc::new(Recorder::default())).unwrap();

        let err = ServiceClient::register(&connection, "X", Rc::new(Recorder::default()))
            .err()
            .unwrap();
        assert!(matches!(err, DebugWireError::DuplicateService(_)));
        assert_eq!(connection.local_services(), vec!["X"]);

        drop(client);
        assert!(connection.local_services().is_empty());
        drain_outbound(&connection);

        ServiceClient::register(&connection, "X", Rc::new(Recorder::default())).unwrap();
    }
}
