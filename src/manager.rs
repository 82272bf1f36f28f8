//! Connection manager: attach to a target with bounded retries.
//!
//! The manager owns at most one [`DebugConnection`] at a time and drives it
//! from [`ConnectionManager::next_event`], which the owner awaits in a loop.
//! A retry timer ticks every `retry_interval` until the handshake completes
//! or `max_retries` ticks have elapsed.
//!
//! On a tick, a connection that already concluded is replaced: TCP dials
//! again and a local socket listens again. An outstanding dial or listener
//! is left alone, so a debuggee that is mid-handshake never loses its
//! socket path.
//!
//! # Example
//!
//! ```ignore
//! use debug_wire::{ConnectionManager, ManagerConfig, ManagerEvent, Target};
//!
//! let mut manager = ConnectionManager::new(ManagerConfig::default());
//! manager.connect("tcp://127.0.0.1:3768".parse()?);
//!
//! while let Some(event) = manager.next_event().await {
//!     match event {
//!         ManagerEvent::Opened => println!("attached"),
//!         ManagerEvent::Closed | ManagerEvent::Failed => break,
//!     }
//! }
//! ```

use std::future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::connection::{ConnectionConfig, ConnectionEvent, ConnectionEvents, DebugConnection};
use crate::error::Result;
use crate::protocol::{DEFAULT_MAX_ENCODING_VERSION, DEFAULT_MAX_PACKET_SIZE};
use crate::transport::Target;

/// Default delay between retry ticks.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Default number of ticks before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Manager tunables. Every field has a default, so partial JSON is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub retry_interval_ms: u64,
    pub max_retries: u32,
    pub max_encoding_version: i32,
    pub max_packet_size: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: DEFAULT_RETRY_INTERVAL.as_millis() as u64,
            max_retries: DEFAULT_MAX_RETRIES,
            max_encoding_version: DEFAULT_MAX_ENCODING_VERSION,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl ManagerConfig {
    /// Parse a JSON object such as `{"retry_interval_ms": 500}`.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_encoding_version: self.max_encoding_version,
            max_packet_size: self.max_packet_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Connecting,
    Connected,
    Failed,
}

/// Lifecycle events surfaced to the manager's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerEvent {
    /// Handshake completed.
    Opened,
    /// An established connection dropped. No automatic retry follows.
    Closed,
    /// Retries exhausted, or a connection failed with no timer running.
    Failed,
}

/// Owner callbacks run whenever a connection is created or destroyed.
///
/// Service clients are registered in `create_clients` and dropped in
/// `destroy_clients`, so they follow the connection across retries.
pub trait ConnectionHooks {
    fn create_clients(&mut self, connection: &DebugConnection);
    fn destroy_clients(&mut self);
}

impl ConnectionHooks for () {
    fn create_clients(&mut self, _connection: &DebugConnection) {}
    fn destroy_clients(&mut self) {}
}

/// Attaches to one target at a time, retrying on a fixed interval.
///
/// Must be used inside a tokio `LocalSet`.
pub struct ConnectionManager<H: ConnectionHooks = ()> {
    config: ManagerConfig,
    hooks: H,
    target: Option<Target>,
    state: ManagerState,
    connection: Option<DebugConnection>,
    events: Option<ConnectionEvents>,
    timer: Option<Interval>,
    attempts: u32,
}

impl ConnectionManager<()> {
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_hooks(config, ())
    }
}

impl<H: ConnectionHooks> ConnectionManager<H> {
    pub fn with_hooks(config: ManagerConfig, hooks: H) -> Self {
        Self {
            config,
            hooks,
            target: None,
            state: ManagerState::Idle,
            connection: None,
            events: None,
            timer: None,
            attempts: 0,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ManagerState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ManagerState::Connecting
    }

    pub fn connection(&self) -> Option<&DebugConnection> {
        self.connection.as_ref()
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    /// Retry ticks elapsed since the last connect, retry or disconnect.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Drop any current connection and start attaching to `target`.
    pub fn connect(&mut self, target: Target) {
        tracing::debug!("Connecting to {}", target);
        self.teardown();
        self.attempts = 0;
        self.target = Some(target);
        self.dispatch();
    }

    /// Start over against the current target immediately.
    pub fn retry_now(&mut self) {
        if self.target.is_none() {
            tracing::warn!("retry_now called without a target");
            return;
        }
        self.teardown();
        self.attempts = 0;
        self.dispatch();
    }

    /// Drop the connection and stop retrying.
    pub fn disconnect(&mut self) {
        self.teardown();
        self.attempts = 0;
        self.state = ManagerState::Idle;
    }

    /// Drive retries and connection events until something happens.
    ///
    /// Returns `None` once there is nothing left to wait for. Cancel-safe.
    pub async fn next_event(&mut self) -> Option<ManagerEvent> {
        loop {
            if self.timer.is_none() && self.events.is_none() {
                return None;
            }

            tokio::select! {
                _ = tick(&mut self.timer) => {
                    if let Some(event) = self.on_tick() {
                        return Some(event);
                    }
                }
                event = recv(&mut self.events) => match event {
                    Some(event) => {
                        if let Some(event) = self.on_connection_event(event) {
                            return Some(event);
                        }
                    }
                    None => self.events = None,
                },
            }
        }
    }

    fn on_tick(&mut self) -> Option<ManagerEvent> {
        self.attempts += 1;

        if self.attempts < self.config.max_retries {
            if self.connection.is_none() {
                if let Some(target) = self.target.clone() {
                    tracing::debug!(
                        "Retrying {} ({}/{})",
                        target,
                        self.attempts,
                        self.config.max_retries
                    );
                    self.create_connection();
                    self.start_transport(&target);
                }
            }
            return None;
        }

        if let Some(target) = &self.target {
            tracing::warn!("Giving up on {} after {} attempts", target, self.attempts);
        }
        self.timer = None;
        self.destroy_connection();
        self.state = ManagerState::Failed;
        Some(ManagerEvent::Failed)
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) -> Option<ManagerEvent> {
        match event {
            ConnectionEvent::Connected => {
                tracing::debug!("Connection opened");
                self.timer = None;
                self.attempts = 0;
                self.state = ManagerState::Connected;
                Some(ManagerEvent::Opened)
            }
            ConnectionEvent::Disconnected => {
                tracing::debug!("Connection closed by peer");
                self.destroy_connection();
                self.state = ManagerState::Idle;
                Some(ManagerEvent::Closed)
            }
            ConnectionEvent::ConnectionFailed => {
                if let Some(error) = self.connection.as_ref().and_then(|c| c.error_string()) {
                    tracing::debug!("Connection attempt failed: {}", error);
                }
                self.destroy_connection();
                if self.timer.is_some() {
                    return None;
                }
                self.state = ManagerState::Failed;
                Some(ManagerEvent::Failed)
            }
        }
    }

    fn dispatch(&mut self) {
        let Some(target) = self.target.clone() else {
            return;
        };

        self.state = ManagerState::Connecting;
        self.create_connection();
        self.start_transport(&target);

        let period = self.config.retry_interval().max(Duration::from_millis(1));
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.timer = Some(timer);
    }

    fn create_connection(&mut self) {
        let (connection, events) = DebugConnection::new(self.config.connection_config());
        self.hooks.create_clients(&connection);
        self.connection = Some(connection);
        self.events = Some(events);
    }

    fn start_transport(&self, target: &Target) {
        let Some(connection) = &self.connection else {
            return;
        };
        match target {
            Target::Tcp { host, port } => connection.connect_to_host(host, *port),
            Target::Local(path) => connection.start_local_server(path),
        }
    }

    fn destroy_connection(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        self.hooks.destroy_clients();
        self.events = None;
        connection.close();
    }

    fn teardown(&mut self) {
        self.timer = None;
        self.destroy_connection();
    }
}

impl<H: ConnectionHooks> Drop for ConnectionManager<H> {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => future::pending().await,
    }
}

async fn recv(events: &mut Option<ConnectionEvents>) -> Option<ConnectionEvent> {
    match events {
        Some(events) => events.recv().await,
        None => future::pending().await,
    }
}
