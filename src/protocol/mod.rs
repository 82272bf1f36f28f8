//! Protocol module - framing, structured fields, and handshake frames.
//!
//! Everything here is sans-IO:
//! - Length-prefixed packet encoding and reassembly
//! - Little-endian structured field reader/writer
//! - Hello and service-discovery frame types

mod datastream;
mod hello;
mod packet;

pub use datastream::{StreamReader, StreamWriter};
pub use hello::{
    DiscoveryUpdate, Hello, PeerHello, BASELINE_ENCODING_VERSION, CLIENT_ID,
    DEFAULT_MAX_ENCODING_VERSION, DEFAULT_SERVICE_VERSION, OP_DISCOVERY, OP_HELLO,
    PROTOCOL_VERSION, SERVER_ID,
};
pub use packet::{
    encode_packet, packet_length, PacketBuffer, DEFAULT_MAX_PACKET_SIZE, LENGTH_PREFIX_SIZE,
};
