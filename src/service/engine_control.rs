//! Engine control service: gate engine start-up and shutdown.
//!
//! The debuggee announces that an engine is about to be added or removed
//! and then blocks until it receives the matching command:
//!
//! ```text
//! inbound:  i32 message, i32 engine_id, string name
//! outbound: i32 command, i32 engine_id
//! ```
//!
//! Local subsystems that need to act before the engine runs (set
//! breakpoints, attach profilers) call [`EngineBarrier::hold`] and later
//! [`EngineBarrier::release`]. The command goes out once, when the last
//! holder releases after the announcement. Each engine may have at most one
//! outstanding announcement, and releasing more often than holding is a
//! caller bug (logged, otherwise ignored).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use bytes::Bytes;

use super::{ServiceClient, ServiceHandler, ServiceLink, ServiceStatus};
use crate::connection::DebugConnection;
use crate::error::{DebugWireError, Result};
use crate::protocol::{StreamReader, StreamWriter};

/// Service name on the wire.
pub const SERVICE_NAME: &str = "EngineControl";

/// Announcement from the debuggee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum EngineMessage {
    AboutToBeAdded = 0,
    Added = 1,
    AboutToBeRemoved = 2,
    Removed = 3,
}

impl TryFrom<i32> for EngineMessage {
    type Error = DebugWireError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::AboutToBeAdded),
            1 => Ok(Self::Added),
            2 => Ok(Self::AboutToBeRemoved),
            3 => Ok(Self::Removed),
            other => Err(DebugWireError::Decode(format!(
                "unknown engine message {}",
                other
            ))),
        }
    }
}

/// Release command sent to the debuggee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum EngineCommand {
    /// Let an engine that is about to be added start running.
    StartWaitingEngine = 0,
    /// Let an engine that is about to be removed go away.
    StopWaitingEngine = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInfo {
    pub id: i32,
    pub name: String,
}

/// Observer of engine lifecycle announcements.
///
/// The `about_to_be` callbacks receive the barrier so a listener can hold
/// the engine before the release decision is made.
pub trait EngineListener {
    fn engine_about_to_be_added(&self, engine: &EngineInfo, barrier: &EngineBarrier) {
        let _ = (engine, barrier);
    }

    fn engine_added(&self, engine: &EngineInfo) {
        let _ = engine;
    }

    fn engine_about_to_be_removed(&self, engine: &EngineInfo, barrier: &EngineBarrier) {
        let _ = (engine, barrier);
    }

    fn engine_removed(&self, engine: &EngineInfo) {
        let _ = engine;
    }
}

#[derive(Default)]
struct Gate {
    blockers: usize,
    /// Command owed to the peer once `blockers` reaches zero.
    waiting: Option<EngineCommand>,
}

struct Shared {
    link: ServiceLink,
    gates: RefCell<HashMap<i32, Gate>>,
    names: RefCell<HashMap<i32, String>>,
    listeners: RefCell<Vec<Rc<dyn EngineListener>>>,
    this: Weak<Shared>,
}

impl Shared {
    fn barrier(&self) -> EngineBarrier {
        EngineBarrier {
            shared: self.this.clone(),
        }
    }

    fn hold(&self, engine_id: i32) {
        let mut gates = self.gates.borrow_mut();
        gates.entry(engine_id).or_default().blockers += 1;
    }

    fn release(&self, engine_id: i32) {
        let command = {
            let mut gates = self.gates.borrow_mut();
            let Some(gate) = gates.get_mut(&engine_id).filter(|gate| gate.blockers > 0) else {
                tracing::warn!("Engine {} released more often than held", engine_id);
                return;
            };

            gate.blockers -= 1;
            if gate.blockers > 0 {
                return;
            }
            gates.remove(&engine_id).and_then(|gate| gate.waiting)
        };

        if let Some(command) = command {
            self.send_command(command, engine_id);
        }
    }

    fn send_command(&self, command: EngineCommand, engine_id: i32) {
        tracing::debug!("Sending {:?} for engine {}", command, engine_id);
        let mut writer = StreamWriter::new();
        writer.write_i32(command as i32).write_i32(engine_id);
        self.link.send(&writer.finish());
    }

    fn announce(&self, engine: &EngineInfo, command: EngineCommand) {
        {
            let mut gates = self.gates.borrow_mut();
            let gate = gates.entry(engine.id).or_default();
            if gate.waiting.is_some() {
                tracing::warn!("Engine {} announced again before release", engine.id);
            }
            gate.waiting = Some(command);
        }

        let barrier = self.barrier();
        for listener in self.listeners() {
            match command {
                EngineCommand::StartWaitingEngine => {
                    listener.engine_about_to_be_added(engine, &barrier)
                }
                EngineCommand::StopWaitingEngine => {
                    listener.engine_about_to_be_removed(engine, &barrier)
                }
            }
        }

        let release_now = {
            let mut gates = self.gates.borrow_mut();
            match gates.get(&engine.id) {
                Some(gate) if gate.blockers == 0 => {
                    gates.remove(&engine.id).and_then(|gate| gate.waiting)
                }
                _ => None,
            }
        };
        if let Some(command) = release_now {
            self.send_command(command, engine.id);
        }
    }

    fn listeners(&self) -> Vec<Rc<dyn EngineListener>> {
        self.listeners.borrow().clone()
    }

    fn handle(&self, message: Bytes) -> Result<()> {
        let mut reader = StreamReader::new(message);
        let kind = EngineMessage::try_from(reader.read_i32()?)?;
        let engine = EngineInfo {
            id: reader.read_i32()?,
            name: reader.read_string()?,
        };
        tracing::debug!("Engine {} ({:?}): {:?}", engine.id, engine.name, kind);

        match kind {
            EngineMessage::AboutToBeAdded => {
                self.names.borrow_mut().insert(engine.id, engine.name.clone());
                self.announce(&engine, EngineCommand::StartWaitingEngine);
            }
            EngineMessage::Added => {
                for listener in self.listeners() {
                    listener.engine_added(&engine);
                }
            }
            EngineMessage::AboutToBeRemoved => {
                self.announce(&engine, EngineCommand::StopWaitingEngine);
            }
            EngineMessage::Removed => {
                self.names.borrow_mut().remove(&engine.id);
                for listener in self.listeners() {
                    listener.engine_removed(&engine);
                }
            }
        }
        Ok(())
    }
}

impl ServiceHandler for Shared {
    fn status_changed(&self, status: ServiceStatus) {
        if status != ServiceStatus::Enabled {
            // Engines blocked on the old peer are gone with it.
            self.gates.borrow_mut().clear();
            self.names.borrow_mut().clear();
        }
    }

    fn message_received(&self, message: Bytes) {
        if let Err(err) = self.handle(message) {
            tracing::warn!("Dropping malformed engine control message: {}", err);
        }
    }
}

/// Reference-counted gate over engine release commands.
#[derive(Clone)]
pub struct EngineBarrier {
    shared: Weak<Shared>,
}

impl EngineBarrier {
    /// Block the release of `engine_id` until a matching [`release`](Self::release).
    pub fn hold(&self, engine_id: i32) {
        if let Some(shared) = self.shared.upgrade() {
            shared.hold(engine_id);
        }
    }

    /// Drop one hold. Sends the pending command when the last hold goes.
    pub fn release(&self, engine_id: i32) {
        if let Some(shared) = self.shared.upgrade() {
            shared.release(engine_id);
        }
    }
}

/// Client for the engine control service.
pub struct EngineControlClient {
    client: ServiceClient,
    shared: Rc<Shared>,
}

impl EngineControlClient {
    pub fn new(connection: &DebugConnection) -> Result<Self> {
        let shared = Rc::new_cyclic(|this| Shared {
            link: ServiceLink::new(connection, SERVICE_NAME),
            gates: RefCell::new(HashMap::new()),
            names: RefCell::new(HashMap::new()),
            listeners: RefCell::new(Vec::new()),
            this: this.clone(),
        });
        let client = ServiceClient::register(connection, SERVICE_NAME, shared.clone())?;
        Ok(Self { client, shared })
    }

    pub fn status(&self) -> ServiceStatus {
        self.client.status()
    }

    pub fn add_listener(&self, listener: Rc<dyn EngineListener>) {
        self.shared.listeners.borrow_mut().push(listener);
    }

    pub fn barrier(&self) -> EngineBarrier {
        self.shared.barrier()
    }

    pub fn hold(&self, engine_id: i32) {
        self.shared.hold(engine_id);
    }

    pub fn release(&self, engine_id: i32) {
        self.shared.release(engine_id);
    }

    /// Engines announced as added and not yet removed.
    pub fn engine_name(&self, engine_id: i32) -> Option<String> {
        self.shared.names.borrow().get(&engine_id).cloned()
    }

    /// Engines with an announcement still waiting on local holders.
    pub fn blocked_engines(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self
            .shared
            .gates
            .borrow()
            .iter()
            .filter(|(_, gate)| gate.waiting.is_some())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }
}
