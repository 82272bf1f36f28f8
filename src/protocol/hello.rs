//! Hello and service-discovery frames.
//!
//! The first packet in each direction is a hello. The tooling side sends:
//!
//! ```text
//! string  SERVER_ID
//! i32     0                    (hello op)
//! i32     PROTOCOL_VERSION
//! string[] local service names (sorted)
//! i32     maximum encoding version
//! bool    supports multi-message packets
//! ```
//!
//! The debuggee answers with:
//!
//! ```text
//! string  CLIENT_ID
//! i32     0
//! i32     PROTOCOL_VERSION
//! string[] service names
//! f32[]   service versions      (optional, 1.0 per missing entry)
//! i32     negotiated encoding   (optional)
//! ```
//!
//! After the handshake, either side may announce a changed service set with
//! a discovery update: `{id, i32 1, string[] names, f32[] versions?}`.

use bytes::Bytes;

use super::datastream::{StreamReader, StreamWriter};
use crate::error::{DebugWireError, Result};

/// Identifier on frames sent by the tooling side.
pub const SERVER_ID: &str = "QDeclarativeDebugServer";

/// Identifier on hello and control frames sent by the debuggee.
pub const CLIENT_ID: &str = "QDeclarativeDebugClient";

/// Handshake protocol version; must match exactly.
pub const PROTOCOL_VERSION: i32 = 1;

/// Control operation: hello.
pub const OP_HELLO: i32 = 0;

/// Control operation: service discovery update.
pub const OP_DISCOVERY: i32 = 1;

/// Encoding version assumed until the peer negotiates one.
pub const BASELINE_ENCODING_VERSION: i32 = 12;

/// Highest encoding version advertised by default.
pub const DEFAULT_MAX_ENCODING_VERSION: i32 = 21;

/// Version reported for a service whose peer omitted versions.
pub const DEFAULT_SERVICE_VERSION: f32 = 1.0;

/// Hello sent by the tooling side when the transport connects.
#[derive(Debug, Clone, PartialEq)]
pub struct Hello {
    /// Locally registered service names, sorted.
    pub services: Vec<String>,
    /// Highest structured-encoding version this side understands.
    pub max_encoding_version: i32,
    /// Whether one packet may carry several messages for a service.
    pub multi_message: bool,
}

impl Hello {
    pub fn new(mut services: Vec<String>, max_encoding_version: i32) -> Self {
        services.sort();
        Self {
            services,
            max_encoding_version,
            multi_message: true,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut writer = StreamWriter::new();
        writer
            .write_string(SERVER_ID)
            .write_i32(OP_HELLO)
            .write_i32(PROTOCOL_VERSION)
            .write_string_list(&self.services)
            .write_i32(self.max_encoding_version)
            .write_bool(self.multi_message);
        writer.finish()
    }

    /// Decode a hello as the debuggee would. Used by test peers.
    pub fn decode(body: Bytes) -> Result<Self> {
        let mut reader = StreamReader::new(body);
        let id = reader.read_string()?;
        let op = reader.read_i32()?;
        let version = reader.read_i32()?;
        check_header(SERVER_ID, &id, op, version)?;

        let services = reader.read_string_list()?;
        let max_encoding_version = reader.read_i32()?;
        let multi_message = reader.read_bool()?;
        Ok(Self {
            services,
            max_encoding_version,
            multi_message,
        })
    }
}

/// Hello received from the debuggee.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHello {
    /// Service names offered by the peer, paired with their versions.
    pub services: Vec<(String, f32)>,
    /// Encoding version chosen by the peer, if it negotiated one.
    pub encoding_version: Option<i32>,
}

impl PeerHello {
    pub fn encode(&self) -> Bytes {
        let (names, versions) = split_services(&self.services);
        let mut writer = StreamWriter::new();
        writer
            .write_string(CLIENT_ID)
            .write_i32(OP_HELLO)
            .write_i32(PROTOCOL_VERSION)
            .write_string_list(&names)
            .write_f32_list(&versions);
        if let Some(version) = self.encoding_version {
            writer.write_i32(version);
        }
        writer.finish()
    }

    /// Decode and validate a hello from the debuggee.
    ///
    /// Fails unless the identifier is [`CLIENT_ID`], the op is hello and the
    /// protocol version matches exactly.
    pub fn decode(body: Bytes) -> Result<Self> {
        let mut reader = StreamReader::new(body);
        let id = reader.read_string()?;
        let op = reader.read_i32()?;
        let version = reader.read_i32()?;
        check_header(CLIENT_ID, &id, op, version)?;

        let services = read_services(&mut reader)?;
        let encoding_version = if reader.at_end() {
            None
        } else {
            Some(reader.read_i32()?)
        };

        Ok(Self {
            services,
            encoding_version,
        })
    }
}

/// Service discovery update, sent by either side after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryUpdate {
    pub services: Vec<(String, f32)>,
}

impl DiscoveryUpdate {
    /// Encode an outbound update carrying only names.
    pub fn encode_names(names: &[String]) -> Bytes {
        let mut writer = StreamWriter::new();
        writer
            .write_string(SERVER_ID)
            .write_i32(OP_DISCOVERY)
            .write_string_list(names);
        writer.finish()
    }

    /// Encode an update as the debuggee sends it.
    pub fn encode(&self) -> Bytes {
        let (names, versions) = split_services(&self.services);
        let mut writer = StreamWriter::new();
        writer
            .write_string(CLIENT_ID)
            .write_i32(OP_DISCOVERY)
            .write_string_list(&names)
            .write_f32_list(&versions);
        writer.finish()
    }

    /// Decode the body that follows the identifier and op code.
    pub fn decode_body(reader: &mut StreamReader) -> Result<Self> {
        Ok(Self {
            services: read_services(reader)?,
        })
    }
}

fn check_header(expected_id: &str, id: &str, op: i32, version: i32) -> Result<()> {
    if id != expected_id || op != OP_HELLO {
        return Err(DebugWireError::Handshake(format!(
            "invalid hello: id {:?}, op {}",
            id, op
        )));
    }
    if version != PROTOCOL_VERSION {
        return Err(DebugWireError::Handshake(format!(
            "protocol version mismatch: peer {}, local {}",
            version, PROTOCOL_VERSION
        )));
    }
    Ok(())
}

/// Read `names[]` and the optional `versions[]` that may follow it.
fn read_services(reader: &mut StreamReader) -> Result<Vec<(String, f32)>> {
    let names = reader.read_string_list()?;
    let versions = if reader.at_end() {
        Vec::new()
    } else {
        reader.read_f32_list()?
    };

    Ok(names
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let version = versions.get(i).copied().unwrap_or(DEFAULT_SERVICE_VERSION);
            (name, version)
        })
        .collect())
}

fn split_services(services: &[(String, f32)]) -> (Vec<String>, Vec<f32>) {
    services.iter().cloned().unzip()
}
