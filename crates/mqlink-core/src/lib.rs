//! mqlink-core - MQTT 3.1.1 packet codec.
//!
//! This crate holds the pure protocol layer shared by the client: the
//! [`Packet`] value type, inbound decoding and validation, outbound encoding,
//! the Remaining Length codec and packet identifier generation. It performs
//! no I/O.

pub mod encode;
pub mod error;
pub mod packet;
pub mod packet_id;
pub mod varint;

pub use encode::{
    encode_connect, encode_disconnect, encode_pingreq, encode_puback, encode_pubcomp,
    encode_pubrec, encode_pubrel, ConnectOptions, LastWill, PacketEncoder,
};
pub use error::{ConnectRefusal, ProtocolError, Result};
pub use packet::{decode_packet, frame_len, HexBytes, Packet, PacketType, QoS};
pub use packet_id::PacketIdGenerator;
