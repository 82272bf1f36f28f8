//! Debug connection: handshake, service registries, and multiplexing.
//!
//! A [`DebugConnection`] owns one transport for its lifetime. When the
//! transport connects it sends a hello advertising the locally registered
//! services; the first packet received back must be the peer's hello. After
//! that every packet is either a control frame (service discovery update) or
//! a data frame routed to the service registered under its leading name.
//!
//! The connection is single-threaded. Handlers are invoked synchronously from
//! the driver task with no internal borrow held, so a handler may send,
//! register, unregister, or close from inside a callback.
//!
//! # Example
//!
//! ```ignore
//! use debug_wire::{DebugConnection, ConnectionEvent};
//!
//! let (connection, mut events) = DebugConnection::new(Default::default());
//! connection.register_service("QmlDebugger", handler)?;
//! connection.connect_to_host("127.0.0.1", 3768);
//!
//! while let Some(event) = events.recv().await {
//!     if event == ConnectionEvent::Connected { break; }
//! }
//! ```

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};

use crate::error::{DebugWireError, Result};
use crate::protocol::{
    DiscoveryUpdate, Hello, PeerHello, StreamReader, StreamWriter, BASELINE_ENCODING_VERSION,
    CLIENT_ID, DEFAULT_MAX_ENCODING_VERSION, DEFAULT_MAX_PACKET_SIZE, OP_DISCOVERY,
};
use crate::service::{ServiceHandler, ServiceStatus};
use crate::transport::driver;

/// Lifecycle events emitted by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake completed.
    Connected,
    /// Transport dropped after a completed handshake.
    Disconnected,
    /// Transport dropped (or hello rejected) before the handshake completed.
    ConnectionFailed,
}

/// Receiver half for [`ConnectionEvent`]s.
pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

/// Per-connection tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Highest structured-encoding version advertised in the hello.
    pub max_encoding_version: i32,
    /// Largest accepted incoming packet, length prefix included.
    pub max_packet_size: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_encoding_version: DEFAULT_MAX_ENCODING_VERSION,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Created, no transport yet.
    Idle,
    /// Dialing or listening.
    Connecting,
    /// Transport up; handshake may or may not be complete.
    Open,
    /// Torn down. Terminal.
    Closed,
}

struct State {
    phase: Phase,
    handshake_complete: bool,
    config: ConnectionConfig,
    encoding_version: i32,
    local: BTreeMap<String, Rc<dyn ServiceHandler>>,
    remote: BTreeMap<String, f32>,
    outbound: VecDeque<Bytes>,
    error: Option<String>,
}

impl State {
    fn queue_discovery(&mut self) {
        let names: Vec<String> = self.local.keys().cloned().collect();
        self.outbound.push_back(DiscoveryUpdate::encode_names(&names));
    }

    fn status_of(&self, name: &str) -> ServiceStatus {
        if !self.handshake_complete {
            ServiceStatus::NotConnected
        } else if self.remote.contains_key(name) {
            ServiceStatus::Enabled
        } else {
            ServiceStatus::Unavailable
        }
    }
}

struct Inner {
    state: RefCell<State>,
    /// Wakes the driver when outbound packets are queued or on close.
    wake: Notify,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

/// Handle to one debug connection. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct DebugConnection {
    inner: Rc<Inner>,
}

/// Non-owning handle to a [`DebugConnection`].
#[derive(Clone, Default)]
pub struct WeakConnection {
    inner: Weak<Inner>,
}

impl WeakConnection {
    pub fn upgrade(&self) -> Option<DebugConnection> {
        self.inner.upgrade().map(|inner| DebugConnection { inner })
    }
}

impl DebugConnection {
    /// Create an idle connection and the receiver for its lifecycle events.
    pub fn new(config: ConnectionConfig) -> (Self, ConnectionEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let state = State {
            phase: Phase::Idle,
            handshake_complete: false,
            config,
            encoding_version: BASELINE_ENCODING_VERSION,
            local: BTreeMap::new(),
            remote: BTreeMap::new(),
            outbound: VecDeque::new(),
            error: None,
        };
        let connection = Self {
            inner: Rc::new(Inner {
                state: RefCell::new(state),
                wake: Notify::new(),
                events,
            }),
        };
        (connection, rx)
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Rc::downgrade(&self.inner),
        }
    }

    // ------------------------------------------------------------------
    // Transport attachment (must run inside a tokio LocalSet)
    // ------------------------------------------------------------------

    /// Dial a TCP server.
    pub fn connect_to_host(&self, host: &str, port: u16) {
        if !self.begin_connecting() {
            return;
        }

        let connection = self.clone();
        let addr = format!("{}:{}", host, port);
        tokio::task::spawn_local(async move {
            tracing::debug!("Connecting to {}", addr);
            let dial = TcpStream::connect(addr.as_str());
            tokio::pin!(dial);

            let result = loop {
                tokio::select! {
                    result = &mut dial => break result,
                    _ = connection.woken() => {
                        if connection.is_closed() {
                            return;
                        }
                    }
                }
            };

            match result {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    driver::drive(connection, stream).await;
                }
                Err(err) => {
                    tracing::debug!("Could not connect to {}: {}", addr, err);
                    connection.transport_disconnected(Some(err.to_string()));
                }
            }
        });
    }

    /// Listen on a local socket path and wait for the debuggee to connect.
    ///
    /// The listener stays up until a peer connects or the connection is
    /// closed; it accepts exactly one peer.
    #[cfg(unix)]
    pub fn start_local_server(&self, path: &std::path::Path) {
        use crate::transport::LocalServer;

        if !self.begin_connecting() {
            return;
        }

        let connection = self.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_local(async move {
            let server = match LocalServer::bind(&path) {
                Ok(server) => server,
                Err(err) => {
                    tracing::warn!("Could not listen on {}: {}", path.display(), err);
                    connection.transport_disconnected(Some(err.to_string()));
                    return;
                }
            };
            tracing::debug!("Waiting for connection on {}", path.display());

            let accepted = loop {
                tokio::select! {
                    accepted = server.accept() => break accepted,
                    _ = connection.woken() => {
                        if connection.is_closed() {
                            return;
                        }
                    }
                }
            };
            drop(server);

            match accepted {
                Ok(stream) => driver::drive(connection, stream).await,
                Err(err) => connection.transport_disconnected(Some(err.to_string())),
            }
        });
    }

    #[cfg(not(unix))]
    pub fn start_local_server(&self, path: &std::path::Path) {
        tracing::warn!("Local sockets are not supported here: {}", path.display());
        if self.begin_connecting() {
            self.transport_disconnected(Some("local sockets are not supported".to_string()));
        }
    }

    /// Run the connection over an already-open stream.
    pub fn attach<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + 'static,
    {
        if !self.begin_connecting() {
            return;
        }
        tokio::task::spawn_local(driver::drive(self.clone(), stream));
    }

    /// Tear the connection down.
    ///
    /// Registered services see `NotConnected` if the handshake had completed,
    /// and `Disconnected` or `ConnectionFailed` is emitted. The transport is
    /// dropped by its driver task on the next poll.
    pub fn close(&self) {
        tracing::debug!("Closing connection");
        self.teardown();
    }

    fn begin_connecting(&self) -> bool {
        let mut state = self.inner.state.borrow_mut();
        if state.phase != Phase::Idle {
            tracing::warn!("Connection already started");
            return false;
        }
        state.phase = Phase::Connecting;
        true
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Whether the handshake has completed and the transport is up.
    pub fn is_connected(&self) -> bool {
        self.inner.state.borrow().handshake_complete
    }

    /// Whether a transport is being established or awaiting the peer hello.
    pub fn is_connecting(&self) -> bool {
        let state = self.inner.state.borrow();
        match state.phase {
            Phase::Connecting => true,
            Phase::Open => !state.handshake_complete,
            Phase::Idle | Phase::Closed => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().phase == Phase::Closed
    }

    /// Version the peer reported for a service, if it offers it.
    pub fn service_version(&self, name: &str) -> Option<f32> {
        self.inner.state.borrow().remote.get(name).copied()
    }

    /// Derived status for a service name.
    pub fn service_status(&self, name: &str) -> ServiceStatus {
        self.inner.state.borrow().status_of(name)
    }

    /// Names of services the peer offers.
    pub fn remote_services(&self) -> Vec<String> {
        self.inner.state.borrow().remote.keys().cloned().collect()
    }

    /// Structured-encoding version in effect.
    pub fn encoding_version(&self) -> i32 {
        self.inner.state.borrow().encoding_version
    }

    pub fn max_encoding_version(&self) -> i32 {
        self.inner.state.borrow().config.max_encoding_version
    }

    /// Change the advertised maximum. Only affects hellos not yet sent.
    pub fn set_max_encoding_version(&self, version: i32) {
        self.inner.state.borrow_mut().config.max_encoding_version = version;
    }

    pub(crate) fn max_packet_size(&self) -> u32 {
        self.inner.state.borrow().config.max_packet_size
    }

    /// Last transport or handshake error.
    pub fn error_string(&self) -> Option<String> {
        self.inner.state.borrow().error.clone()
    }

    // ------------------------------------------------------------------
    // Service registry
    // ------------------------------------------------------------------

    /// Register a local service handler under a unique name.
    ///
    /// If the handshake already completed the peer is told about the new
    /// service set immediately.
    pub fn register_service(&self, name: &str, handler: Rc<dyn ServiceHandler>) -> Result<()> {
        let mut state = self.inner.state.borrow_mut();
        if state.local.contains_key(name) {
            return Err(DebugWireError::DuplicateService(name.to_string()));
        }
        state.local.insert(name.to_string(), handler);

        if state.handshake_complete {
            state.queue_discovery();
            drop(state);
            self.inner.wake.notify_one();
        }
        Ok(())
    }

    /// Remove a local service. Returns whether it was registered.
    pub fn unregister_service(&self, name: &str) -> bool {
        let mut state = self.inner.state.borrow_mut();
        if state.local.remove(name).is_none() {
            return false;
        }

        if state.handshake_complete {
            state.queue_discovery();
            drop(state);
            self.inner.wake.notify_one();
        }
        true
    }

    /// Names of locally registered services, sorted.
    pub fn local_services(&self) -> Vec<String> {
        self.inner.state.borrow().local.keys().cloned().collect()
    }

    /// Queue a message for a service the peer offers.
    ///
    /// Returns `false` without sending unless the handshake is complete and
    /// the peer advertised `name`.
    pub fn send_message(&self, name: &str, payload: &[u8]) -> bool {
        let mut state = self.inner.state.borrow_mut();
        if state.phase != Phase::Open
            || !state.handshake_complete
            || !state.remote.contains_key(name)
        {
            return false;
        }

        let mut writer = StreamWriter::new();
        writer.write_string(name).write_bytes(payload);
        state.outbound.push_back(writer.finish());
        drop(state);

        self.inner.wake.notify_one();
        true
    }

    // ------------------------------------------------------------------
    // Driver interface
    // ------------------------------------------------------------------

    /// Transport connected: send the hello.
    pub(crate) fn transport_connected(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Open;

            let names = state.local.keys().cloned().collect();
            let hello = Hello::new(names, state.config.max_encoding_version);
            state.outbound.push_back(hello.encode());
        }
        tracing::debug!("Transport connected, hello queued");
        self.inner.wake.notify_one();
    }

    /// Transport dropped, optionally with an error description.
    pub(crate) fn transport_disconnected(&self, error: Option<String>) {
        if let Some(error) = error {
            self.inner.state.borrow_mut().error = Some(error);
        }
        self.teardown();
    }

    /// Pop the next packet body to write.
    pub(crate) fn next_outbound(&self) -> Option<Bytes> {
        self.inner.state.borrow_mut().outbound.pop_front()
    }

    /// Resolves when outbound data is queued or the connection closes.
    pub(crate) async fn woken(&self) {
        self.inner.wake.notified().await
    }

    /// Handle one complete incoming packet.
    pub(crate) fn receive_frame(&self, frame: Bytes) {
        let handshake_complete = {
            let state = self.inner.state.borrow();
            if state.phase != Phase::Open {
                return;
            }
            state.handshake_complete
        };

        if handshake_complete {
            self.receive_message(frame);
        } else {
            self.receive_hello(frame);
        }
    }

    fn receive_hello(&self, frame: Bytes) {
        let hello = match PeerHello::decode(frame) {
            Ok(hello) => hello,
            Err(err) => {
                tracing::warn!("Rejecting peer hello: {}", err);
                self.transport_disconnected(Some(err.to_string()));
                return;
            }
        };

        let notifications: Vec<_> = {
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;

            state.handshake_complete = true;
            state.remote = hello.services.into_iter().collect();

            if let Some(version) = hello.encoding_version {
                if version > state.config.max_encoding_version {
                    // Adopted anyway; clamping would change observable behaviour.
                    tracing::warn!(
                        "Peer negotiated encoding version {} above local maximum {}",
                        version,
                        state.config.max_encoding_version
                    );
                }
                state.encoding_version = version;
            }

            state
                .local
                .iter()
                .map(|(name, handler)| (handler.clone(), state.status_of(name)))
                .collect()
        };

        tracing::debug!("Handshake complete");
        for (handler, status) in notifications {
            if self.is_closed() {
                return;
            }
            handler.status_changed(status);
        }
        if !self.is_closed() {
            self.emit(ConnectionEvent::Connected);
        }
    }

    fn receive_message(&self, frame: Bytes) {
        let mut reader = StreamReader::new(frame);
        let name = match reader.read_string() {
            Ok(name) => name,
            Err(err) => {
                tracing::warn!("Dropping packet without service name: {}", err);
                return;
            }
        };

        if name == CLIENT_ID {
            match reader.read_i32() {
                Ok(OP_DISCOVERY) => self.receive_discovery(&mut reader),
                Ok(op) => tracing::warn!("Ignoring unknown control operation {}", op),
                Err(err) => tracing::warn!("Dropping truncated control packet: {}", err),
            }
            return;
        }

        let handler = self.inner.state.borrow().local.get(&name).cloned();
        let Some(handler) = handler else {
            tracing::warn!("Dropping message for unregistered service {:?}", name);
            return;
        };

        while !reader.at_end() {
            match reader.read_bytes() {
                Ok(message) => handler.message_received(message),
                Err(err) => {
                    tracing::warn!("Truncated message for service {:?}: {}", name, err);
                    return;
                }
            }
            if self.is_closed() {
                return;
            }
        }
    }

    fn receive_discovery(&self, reader: &mut StreamReader) {
        let update = match DiscoveryUpdate::decode_body(reader) {
            Ok(update) => update,
            Err(err) => {
                tracing::warn!("Dropping malformed discovery update: {}", err);
                return;
            }
        };

        let flipped: Vec<_> = {
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            let remote: BTreeMap<String, f32> = update.services.into_iter().collect();

            let flipped = state
                .local
                .iter()
                .filter(|(name, _)| {
                    state.remote.contains_key(name.as_str()) != remote.contains_key(name.as_str())
                })
                .map(|(name, handler)| {
                    let status = if remote.contains_key(name.as_str()) {
                        ServiceStatus::Enabled
                    } else {
                        ServiceStatus::Unavailable
                    };
                    (handler.clone(), status)
                })
                .collect();

            state.remote = remote;
            flipped
        };

        for (handler, status) in flipped {
            if self.is_closed() {
                return;
            }
            handler.status_changed(status);
        }
    }

    fn teardown(&self) {
        let (was_connected, handlers): (bool, Vec<Rc<dyn ServiceHandler>>) = {
            let mut state = self.inner.state.borrow_mut();
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Closed;
            state.outbound.clear();
            state.remote.clear();

            let was_connected = std::mem::replace(&mut state.handshake_complete, false);
            let handlers = if was_connected {
                state.local.values().cloned().collect()
            } else {
                Vec::new()
            };
            (was_connected, handlers)
        };

        // Let the driver observe the closed phase and drop the transport.
        self.inner.wake.notify_one();

        if was_connected {
            for handler in handlers {
                handler.status_changed(ServiceStatus::NotConnected);
            }
            self.emit(ConnectionEvent::Disconnected);
        } else {
            self.emit(ConnectionEvent::ConnectionFailed);
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // The receiver is dropped once the owner stops listening.
        let _ = self.inner.events.send(event);
    }
}

impl fmt::Debug for DebugConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("DebugConnection")
            .field("phase", &state.phase)
            .field("handshake_complete", &state.handshake_complete)
            .field("local", &state.local.keys().collect::<Vec<_>>())
            .field("remote", &state.remote)
            .finish()
    }
}
