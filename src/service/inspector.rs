//! Inspector service: query/response introspection of a running engine.
//!
//! Every request carries a locally generated query id which the reply
//! echoes, so replies can arrive in any order:
//!
//! ```text
//! request:  string kind, u32 query_id, args...
//! reply:    string kind + "_R", u32 query_id, result...
//! notify:   string "UPDATE_WATCH" | "OBJECT_CREATED", fields...
//! ```
//!
//! Object trees are decoded recursively. A non-simple object carries its
//! children and properties; when the request was not recursive, children
//! arrive in simple form (identity fields only).
//!
//! # Example
//!
//! ```ignore
//! use debug_wire::service::inspector::{InspectorClient, InspectorEvent, QueryResult};
//!
//! let (inspector, mut events) = InspectorClient::new(&connection)?;
//! // once Enabled:
//! let query = inspector.query_engines();
//! while let Some(event) = events.recv().await {
//!     if let InspectorEvent::Result { result: QueryResult::Engines(engines), .. } = event {
//!         println!("{:?}", engines);
//!     }
//! }
//! ```

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{ServiceClient, ServiceHandler, ServiceStatus};
use crate::connection::DebugConnection;
use crate::error::{DebugWireError, Result};
use crate::protocol::{StreamReader, StreamWriter};

/// Service name on the wire.
pub const SERVICE_NAME: &str = "QmlDebugger";

/// Correlation token for one request.
pub type QueryId = u32;

/// Deepest object nesting accepted from the peer.
const MAX_OBJECT_DEPTH: usize = 256;

mod kind {
    pub const LIST_ENGINES: &str = "LIST_ENGINES";
    pub const LIST_OBJECTS: &str = "LIST_OBJECTS";
    pub const FETCH_OBJECT: &str = "FETCH_OBJECT";
    pub const FETCH_OBJECTS_FOR_LOCATION: &str = "FETCH_OBJECTS_FOR_LOCATION";
    pub const EVAL_EXPRESSION: &str = "EVAL_EXPRESSION";
    pub const WATCH_PROPERTY: &str = "WATCH_PROPERTY";
    pub const WATCH_OBJECT: &str = "WATCH_OBJECT";
    pub const NO_WATCH: &str = "NO_WATCH";
    pub const SET_BINDING: &str = "SET_BINDING";
    pub const RESET_BINDING: &str = "RESET_BINDING";

    pub const UPDATE_WATCH: &str = "UPDATE_WATCH";
    pub const OBJECT_CREATED: &str = "OBJECT_CREATED";

    pub const REPLY_SUFFIX: &str = "_R";
}

// ============================================================================
// Result types
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct EngineReference {
    pub debug_id: i32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FileReference {
    pub url: String,
    pub line: i32,
    pub column: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i32),
    Number(f64),
    String(String),
    /// Reference to another object by debug id.
    Object(i32),
    List(Vec<PropertyValue>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyReference {
    pub object_debug_id: i32,
    pub name: String,
    pub value_type_name: String,
    pub value: PropertyValue,
    pub has_notify_signal: bool,
    /// Binding expression, empty if the value is not bound.
    pub binding: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectReference {
    pub debug_id: i32,
    pub class_name: String,
    pub id_string: String,
    pub name: String,
    pub source: FileReference,
    pub context_debug_id: i32,
    pub parent_id: i32,
    /// Empty for objects decoded in simple form.
    pub children: Vec<ObjectReference>,
    pub properties: Vec<PropertyReference>,
    /// Whether children and properties were transmitted.
    pub needs_more_data: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContextReference {
    pub debug_id: i32,
    pub name: String,
    pub objects: Vec<ObjectReference>,
    pub contexts: Vec<ContextReference>,
}

/// Decoded reply to one request.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Engines(Vec<EngineReference>),
    RootContext(ContextReference),
    Object(ObjectReference),
    ObjectsForLocation(Vec<ObjectReference>),
    Expression(PropertyValue),
    /// Watch, unwatch and binding requests only report success.
    Ack(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InspectorEvent {
    StatusChanged(ServiceStatus),
    Result {
        query_id: QueryId,
        result: QueryResult,
    },
    WatchUpdated {
        watch_id: QueryId,
        object_id: i32,
        property: String,
        value: PropertyValue,
    },
    ObjectCreated {
        engine_id: i32,
        object_id: i32,
        parent_id: i32,
    },
}

// ============================================================================
// Client
// ============================================================================

struct PendingQuery {
    kind: &'static str,
    recursive: bool,
}

struct Shared {
    next_query_id: Cell<QueryId>,
    pending: RefCell<HashMap<QueryId, PendingQuery>>,
    events: mpsc::UnboundedSender<InspectorEvent>,
}

impl Shared {
    fn allocate_query_id(&self) -> QueryId {
        let id = self.next_query_id.get();
        self.next_query_id.set(id.wrapping_add(1).max(1));
        id
    }

    fn emit(&self, event: InspectorEvent) {
        let _ = self.events.send(event);
    }

    fn handle(&self, message: Bytes) -> Result<()> {
        let mut reader = StreamReader::new(message);
        let message_kind = reader.read_string()?;

        match message_kind.as_str() {
            kind::UPDATE_WATCH => {
                let watch_id = reader.read_u32()?;
                let object_id = reader.read_i32()?;
                let property = reader.read_string()?;
                let value = decode_value(&mut reader, 0)?;
                self.emit(InspectorEvent::WatchUpdated {
                    watch_id,
                    object_id,
                    property,
                    value,
                });
                return Ok(());
            }
            kind::OBJECT_CREATED => {
                let engine_id = reader.read_i32()?;
                let object_id = reader.read_i32()?;
                let parent_id = reader.read_i32()?;
                self.emit(InspectorEvent::ObjectCreated {
                    engine_id,
                    object_id,
                    parent_id,
                });
                return Ok(());
            }
            _ => {}
        }

        let Some(request_kind) = message_kind.strip_suffix(kind::REPLY_SUFFIX) else {
            tracing::warn!("Unknown inspector message {:?}", message_kind);
            return Ok(());
        };

        let query_id = reader.read_u32()?;
        let pending = {
            let mut pending = self.pending.borrow_mut();
            match pending.get(&query_id) {
                None => {
                    tracing::debug!("Reply {:?} for unknown query {}", message_kind, query_id);
                    return Ok(());
                }
                Some(query) if query.kind != request_kind => {
                    tracing::warn!(
                        "Reply {:?} does not match query {} ({})",
                        message_kind,
                        query_id,
                        query.kind
                    );
                    return Ok(());
                }
                Some(_) => {}
            }
            match pending.remove(&query_id) {
                Some(query) => query,
                None => return Ok(()),
            }
        };

        let result = match pending.kind {
            kind::LIST_ENGINES => QueryResult::Engines(decode_engines(&mut reader)?),
            kind::LIST_OBJECTS => QueryResult::RootContext(decode_context(&mut reader, 0)?),
            kind::FETCH_OBJECT => {
                QueryResult::Object(decode_object(&mut reader, false, pending.recursive, 0)?)
            }
            kind::FETCH_OBJECTS_FOR_LOCATION => {
                let count = reader.read_count(4)?;
                let objects = (0..count)
                    .map(|_| decode_object(&mut reader, false, pending.recursive, 0))
                    .collect::<Result<Vec<_>>>()?;
                QueryResult::ObjectsForLocation(objects)
            }
            kind::EVAL_EXPRESSION => QueryResult::Expression(decode_value(&mut reader, 0)?),
            _ => QueryResult::Ack(reader.read_bool()?),
        };

        self.emit(InspectorEvent::Result { query_id, result });
        Ok(())
    }
}

impl ServiceHandler for Shared {
    fn status_changed(&self, status: ServiceStatus) {
        if status != ServiceStatus::Enabled {
            self.pending.borrow_mut().clear();
        }
        self.emit(InspectorEvent::StatusChanged(status));
    }

    fn message_received(&self, message: Bytes) {
        if let Err(err) = self.handle(message) {
            tracing::warn!("Dropping malformed inspector message: {}", err);
        }
    }
}

/// Client for the inspector service.
pub struct InspectorClient {
    client: ServiceClient,
    shared: Rc<Shared>,
}

impl InspectorClient {
    /// Register on `connection` and return the client with its event stream.
    pub fn new(
        connection: &DebugConnection,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InspectorEvent>)> {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Rc::new(Shared {
            next_query_id: Cell::new(1),
            pending: RefCell::new(HashMap::new()),
            events,
        });
        let client = ServiceClient::register(connection, SERVICE_NAME, shared.clone())?;
        Ok((Self { client, shared }, rx))
    }

    pub fn status(&self) -> ServiceStatus {
        self.client.status()
    }

    /// Number of requests still awaiting a reply.
    pub fn pending_queries(&self) -> usize {
        self.shared.pending.borrow().len()
    }

    pub fn query_engines(&self) -> Option<QueryId> {
        self.request(kind::LIST_ENGINES, false, |_| {})
    }

    pub fn query_root_contexts(&self, engine_id: i32) -> Option<QueryId> {
        self.request(kind::LIST_OBJECTS, false, |w| {
            w.write_i32(engine_id);
        })
    }

    /// Fetch one object. With `recursive`, the whole subtree is returned.
    pub fn query_object(&self, object_id: i32, recursive: bool) -> Option<QueryId> {
        self.request(kind::FETCH_OBJECT, recursive, |w| {
            w.write_i32(object_id).write_bool(recursive).write_bool(true);
        })
    }

    pub fn query_objects_for_location(
        &self,
        file: &str,
        line: i32,
        column: i32,
        recursive: bool,
    ) -> Option<QueryId> {
        self.request(kind::FETCH_OBJECTS_FOR_LOCATION, recursive, |w| {
            w.write_string(file)
                .write_i32(line)
                .write_i32(column)
                .write_bool(recursive)
                .write_bool(true);
        })
    }

    /// Evaluate `expression` in the scope of an object.
    pub fn query_expression(&self, object_id: i32, expression: &str) -> Option<QueryId> {
        self.request(kind::EVAL_EXPRESSION, false, |w| {
            w.write_i32(object_id).write_string(expression);
        })
    }

    /// Watch one property. The returned id tags later `WatchUpdated` events.
    pub fn add_watch(&self, object_id: i32, property: &str) -> Option<QueryId> {
        self.request(kind::WATCH_PROPERTY, false, |w| {
            w.write_i32(object_id).write_string(property);
        })
    }

    pub fn add_object_watch(&self, object_id: i32) -> Option<QueryId> {
        self.request(kind::WATCH_OBJECT, false, |w| {
            w.write_i32(object_id);
        })
    }

    pub fn remove_watch(&self, watch_id: QueryId) -> Option<QueryId> {
        self.request(kind::NO_WATCH, false, |w| {
            w.write_u32(watch_id);
        })
    }

    pub fn set_binding(
        &self,
        object_id: i32,
        property: &str,
        value: &str,
        is_literal: bool,
    ) -> Option<QueryId> {
        self.request(kind::SET_BINDING, false, |w| {
            w.write_i32(object_id)
                .write_string(property)
                .write_string(value)
                .write_bool(is_literal);
        })
    }

    pub fn reset_binding(&self, object_id: i32, property: &str) -> Option<QueryId> {
        self.request(kind::RESET_BINDING, false, |w| {
            w.write_i32(object_id).write_string(property);
        })
    }

    fn request(
        &self,
        kind: &'static str,
        recursive: bool,
        args: impl FnOnce(&mut StreamWriter),
    ) -> Option<QueryId> {
        if self.client.status() != ServiceStatus::Enabled {
            tracing::debug!("Inspector not enabled, dropping {} request", kind);
            return None;
        }

        let query_id = self.shared.allocate_query_id();
        let mut writer = StreamWriter::new();
        writer.write_string(kind).write_u32(query_id);
        args(&mut writer);

        if !self.client.send(&writer.finish()) {
            return None;
        }
        self.shared
            .pending
            .borrow_mut()
            .insert(query_id, PendingQuery { kind, recursive });
        Some(query_id)
    }
}

// ============================================================================
// Decoding
// ============================================================================

mod tag {
    pub const NULL: u8 = 0;
    pub const BOOL: u8 = 1;
    pub const INT: u8 = 2;
    pub const NUMBER: u8 = 3;
    pub const STRING: u8 = 4;
    pub const OBJECT: u8 = 5;
    pub const LIST: u8 = 6;
}

fn check_depth(depth: usize) -> Result<()> {
    if depth > MAX_OBJECT_DEPTH {
        return Err(DebugWireError::Decode(format!(
            "nesting deeper than {}",
            MAX_OBJECT_DEPTH
        )));
    }
    Ok(())
}

fn decode_engines(reader: &mut StreamReader) -> Result<Vec<EngineReference>> {
    let count = reader.read_count(8)?;
    let mut engines = Vec::with_capacity(count);
    for _ in 0..count {
        engines.push(EngineReference {
            name: reader.read_string()?,
            debug_id: reader.read_i32()?,
        });
    }
    Ok(engines)
}

fn decode_value(reader: &mut StreamReader, depth: usize) -> Result<PropertyValue> {
    check_depth(depth)?;
    let value = match reader.read_u8()? {
        tag::NULL => PropertyValue::Null,
        tag::BOOL => PropertyValue::Bool(reader.read_bool()?),
        tag::INT => PropertyValue::Int(reader.read_i32()?),
        tag::NUMBER => PropertyValue::Number(reader.read_f64()?),
        tag::STRING => PropertyValue::String(reader.read_string()?),
        tag::OBJECT => PropertyValue::Object(reader.read_i32()?),
        tag::LIST => {
            let count = reader.read_count(1)?;
            let items = (0..count)
                .map(|_| decode_value(reader, depth + 1))
                .collect::<Result<Vec<_>>>()?;
            PropertyValue::List(items)
        }
        other => {
            return Err(DebugWireError::Decode(format!(
                "unknown property value tag {}",
                other
            )))
        }
    };
    Ok(value)
}

fn decode_property(reader: &mut StreamReader, object_debug_id: i32) -> Result<PropertyReference> {
    Ok(PropertyReference {
        object_debug_id,
        name: reader.read_string()?,
        value_type_name: reader.read_string()?,
        value: decode_value(reader, 0)?,
        has_notify_signal: reader.read_bool()?,
        binding: reader.read_string()?,
    })
}

/// Decode one object.
///
/// A `simple` object carries only its identity fields. Otherwise children
/// follow, decoded in full when `recursive` and in simple form otherwise,
/// then the object's properties.
fn decode_object(
    reader: &mut StreamReader,
    simple: bool,
    recursive: bool,
    depth: usize,
) -> Result<ObjectReference> {
    check_depth(depth)?;

    let mut object = ObjectReference {
        debug_id: reader.read_i32()?,
        class_name: reader.read_string()?,
        id_string: reader.read_string()?,
        name: reader.read_string()?,
        source: FileReference {
            url: reader.read_string()?,
            line: reader.read_i32()?,
            column: reader.read_i32()?,
        },
        context_debug_id: reader.read_i32()?,
        parent_id: reader.read_i32()?,
        ..Default::default()
    };

    if simple {
        object.needs_more_data = true;
        return Ok(object);
    }

    let child_count = reader.read_count(4)?;
    for _ in 0..child_count {
        let child = decode_object(reader, !recursive, recursive, depth + 1)?;
        object.children.push(child);
    }

    let property_count = reader.read_count(4)?;
    for _ in 0..property_count {
        let property = decode_property(reader, object.debug_id)?;
        object.properties.push(property);
    }

    Ok(object)
}

fn decode_context(reader: &mut StreamReader, depth: usize) -> Result<ContextReference> {
    check_depth(depth)?;

    let mut context = ContextReference {
        name: reader.read_string()?,
        debug_id: reader.read_i32()?,
        ..Default::default()
    };

    let object_count = reader.read_count(4)?;
    for _ in 0..object_count {
        context.objects.push(decode_object(reader, true, false, depth + 1)?);
    }

    let context_count = reader.read_count(4)?;
    for _ in 0..context_count {
        context.contexts.push(decode_context(reader, depth + 1)?);
    }

    Ok(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{data_frame, drain_outbound, open_connection, peer_hello};
    use crate::connection::ConnectionEvents;

    fn enabled_inspector() -> (
        DebugConnection,
        ConnectionEvents,
        InspectorClient,
        mpsc::UnboundedReceiver<InspectorEvent>,
    ) {
        let (connection, conn_events) = open_connection();
        let (inspector, mut events) = InspectorClient::new(&connection).unwrap();
        connection.receive_frame(peer_hello(&[SERVICE_NAME]));
        drain_outbound(&connection);
        assert_eq!(
            events.try_recv().unwrap(),
            InspectorEvent::StatusChanged(ServiceStatus::Enabled)
        );
        (connection, conn_events, inspector, events)
    }

    /// Split an outbound data frame into service name and request message.
    fn sent_request(connection: &DebugConnection) -> StreamReader {
        let frames = drain_outbound(connection);
        assert_eq!(frames.len(), 1);
        let mut frame = StreamReader::new(frames[0].clone());
        assert_eq!(frame.read_string().unwrap(), SERVICE_NAME);
        let message = frame.read_bytes().unwrap();
        assert!(frame.at_end());
        StreamReader::new(message)
    }

    fn write_object_header(w: &mut StreamWriter, debug_id: i32, class_name: &str, parent_id: i32) {
        w.write_i32(debug_id)
            .write_string(class_name)
            .write_string("")
            .write_string("")
            .write_string("file:///main.qml")
            .write_i32(debug_id)
            .write_i32(1)
            .write_i32(0)
            .write_i32(parent_id);
    }

    fn reply(connection: &DebugConnection, message: Bytes) {
        connection.receive_frame(data_frame(SERVICE_NAME, &[&message[..]]));
    }

    #[test]
    fn test_requests_require_enabled_service() {
        let (connection, _conn_events) = open_connection();
        let (inspector, _events) = InspectorClient::new(&connection).unwrap();
        assert_eq!(inspector.query_engines(), None);

        connection.receive_frame(peer_hello(&["Other"]));
        assert_eq!(inspector.status(), ServiceStatus::Unavailable);
        assert_eq!(inspector.query_engines(), None);
        assert_eq!(inspector.pending_queries(), 0);
    }

    #[test]
    fn test_query_ids_are_monotonic() {
        let (connection, _conn_events, inspector, _events) = enabled_inspector();

        assert_eq!(inspector.query_engines(), Some(1));
        let mut request = sent_request(&connection);
        assert_eq!(request.read_string().unwrap(), "LIST_ENGINES");
        assert_eq!(request.read_u32().unwrap(), 1);

        assert_eq!(inspector.query_object(7, true), Some(2));
        let mut request = sent_request(&connection);
        assert_eq!(request.read_string().unwrap(), "FETCH_OBJECT");
        assert_eq!(request.read_u32().unwrap(), 2);
        assert_eq!(request.read_i32().unwrap(), 7);
        assert!(request.read_bool().unwrap());

        assert_eq!(inspector.pending_queries(), 2);
    }

    #[test]
    fn test_engine_list_reply() {
        let (connection, _conn_events, inspector, mut events) = enabled_inspector();
        let query = inspector.query_engines().unwrap();

        let mut w = StreamWriter::new();
        w.write_string("LIST_ENGINES_R")
            .write_u32(query)
            .write_u32(2)
            .write_string("main")
            .write_i32(1)
            .write_string("worker")
            .write_i32(2);
        reply(&connection, w.finish());

        assert_eq!(
            events.try_recv().unwrap(),
            InspectorEvent::Result {
                query_id: query,
                result: QueryResult::Engines(vec![
                    EngineReference { debug_id: 1, name: "main".into() },
                    EngineReference { debug_id: 2, name: "worker".into() },
                ]),
            }
        );
        assert_eq!(inspector.pending_queries(), 0);
    }

    #[test]
    fn test_recursive_fetch_decodes_nested_children() {
        let (connection, _conn_events, inspector, mut events) = enabled_inspector();
        let query = inspector.query_object(1, true).unwrap();

        let mut w = StreamWriter::new();
        w.write_string("FETCH_OBJECT_R").write_u32(query);
        write_object_header(&mut w, 1, "Window", -1);
        w.write_u32(1);
        write_object_header(&mut w, 2, "Item", 1);
        w.write_u32(1);
        write_object_header(&mut w, 3, "Text", 2);
        w.write_u32(0).write_u32(0);
        w.write_u32(0);
        w.write_u32(1)
            .write_string("width")
            .write_string("int")
            .write_u8(2)
            .write_i32(640)
            .write_bool(true)
            .write_string("");
        reply(&connection, w.finish());

        let InspectorEvent::Result {
            result: QueryResult::Object(root),
            ..
        } = events.try_recv().unwrap()
        else {
            panic!("expected object result");
        };
        assert_eq!(root.class_name, "Window");
        assert_eq!(root.children[0].class_name, "Item");
        assert_eq!(root.children[0].children[0].debug_id, 3);
        assert!(!root.children[0].needs_more_data);
        assert_eq!(root.properties[0].value, PropertyValue::Int(640));
        assert_eq!(root.properties[0].object_debug_id, 1);
    }

    #[test]
    fn test_shallow_fetch_decodes_simple_children() {
        let (connection, _conn_events, inspector, mut events) = enabled_inspector();
        let query = inspector.query_object(1, false).unwrap();

        let mut w = StreamWriter::new();
        w.write_string("FETCH_OBJECT_R").write_u32(query);
        write_object_header(&mut w, 1, "Window", -1);
        w.write_u32(2);
        write_object_header(&mut w, 2, "Item", 1);
        write_object_header(&mut w, 3, "Item", 1);
        w.write_u32(0);
        reply(&connection, w.finish());

        let InspectorEvent::Result {
            result: QueryResult::Object(root),
            ..
        } = events.try_recv().unwrap()
        else {
            panic!("expected object result");
        };
        assert_eq!(root.children.len(), 2);
        assert!(root.children.iter().all(|child| child.needs_more_data));
        assert!(root.children[1].children.is_empty());
    }

    #[test]
    fn test_expression_with_object_reference_list() {
        let (connection, _conn_events, inspector, mut events) = enabled_inspector();
        let query = inspector.query_expression(1, "children").unwrap();

        let mut w = StreamWriter::new();
        w.write_string("EVAL_EXPRESSION_R")
            .write_u32(query)
            .write_u8(6)
            .write_u32(2)
            .write_u8(5)
            .write_i32(10)
            .write_u8(0);
        reply(&connection, w.finish());

        assert_eq!(
            events.try_recv().unwrap(),
            InspectorEvent::Result {
                query_id: query,
                result: QueryResult::Expression(PropertyValue::List(vec![
                    PropertyValue::Object(10),
                    PropertyValue::Null,
                ])),
            }
        );
    }

    #[test]
    fn test_watch_update_notification() {
        let (connection, _conn_events, inspector, mut events) = enabled_inspector();
        let watch = inspector.add_watch(4, "text").unwrap();

        let mut ack = StreamWriter::new();
        ack.write_string("WATCH_PROPERTY_R").write_u32(watch).write_bool(true);
        let mut update = StreamWriter::new();
        update
            .write_string("UPDATE_WATCH")
            .write_u32(watch)
            .write_i32(4)
            .write_string("text")
            .write_u8(4)
            .write_string("hello");
        let (ack, update) = (ack.finish(), update.finish());
        connection.receive_frame(data_frame(SERVICE_NAME, &[&ack[..], &update[..]]));

        assert_eq!(
            events.try_recv().unwrap(),
            InspectorEvent::Result {
                query_id: watch,
                result: QueryResult::Ack(true),
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            InspectorEvent::WatchUpdated {
                watch_id: watch,
                object_id: 4,
                property: "text".into(),
                value: PropertyValue::String("hello".into()),
            }
        );
    }

    #[test]
    fn test_unknown_and_malformed_replies_are_dropped() {
        let (connection, _conn_events, inspector, mut events) = enabled_inspector();
        let query = inspector.query_engines().unwrap();

        let mut unknown = StreamWriter::new();
        unknown.write_string("LIST_ENGINES_R").write_u32(query + 100).write_u32(0);
        let mut mismatched = StreamWriter::new();
        mismatched.write_string("FETCH_OBJECT_R").write_u32(query);
        let mut truncated = StreamWriter::new();
        truncated.write_string("OBJECT_CREATED").write_i32(1);

        for message in [unknown.finish(), mismatched.finish(), truncated.finish()] {
            reply(&connection, message);
        }

        assert!(events.try_recv().is_err());
        assert!(connection.is_connected());
    }

    #[test]
    fn test_pending_cleared_on_disconnect() {
        let (connection, _conn_events, inspector, mut events) = enabled_inspector();
        inspector.query_engines().unwrap();
        assert_eq!(inspector.pending_queries(), 1);

        connection.close();

        assert_eq!(inspector.pending_queries(), 0);
        assert_eq!(
            events.try_recv().unwrap(),
            InspectorEvent::StatusChanged(ServiceStatus::NotConnected)
        );
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let mut w = StreamWriter::new();
        for _ in 0..=MAX_OBJECT_DEPTH + 1 {
            w.write_u8(tag::LIST).write_u32(1);
        }
        w.write_u8(tag::NULL);

        let mut reader = StreamReader::new(w.finish());
        assert!(matches!(
            decode_value(&mut reader, 0),
            Err(DebugWireError::Decode(_))
        ));
    }
}
