//! MQTT 3.1.1 control packets and the inbound decoder.

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::error::{ConnectRefusal, ProtocolError, Result};
use crate::varint;

/// Mask selecting the packet type nibble of a command byte.
pub const TYPE_MASK: u8 = 0xF0;
/// DUP flag (bit 3) of a command byte.
pub const DUP_BIT: u8 = 0x08;
/// QoS bits (bits 2-1) of a PUBLISH command byte.
pub const QOS_MASK: u8 = 0x06;
/// RETAIN flag (bit 0) of a PUBLISH command byte.
pub const RETAIN_BIT: u8 = 0x01;
/// Reserved flags that PUBREL and SUBSCRIBE must carry.
pub const RESERVED_FLAGS: u8 = 0x02;

/// MQTT Control Packet Types (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl PacketType {
    /// Packet type of a full command byte (flags are ignored).
    pub fn from_command(command: u8) -> Result<Self> {
        PacketType::try_from(command >> 4).map_err(|_| ProtocolError::UnknownCommand(command))
    }

    /// Command byte of this type with all flag bits cleared.
    pub fn base_byte(self) -> u8 {
        (self as u8) << 4
    }
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            15 => Ok(PacketType::Auth),
            _ => Err(ProtocolError::UnknownCommand(value << 4)),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, PartialOrd, Ord)]
#[repr(u8)]
#[allow(clippy::enum_variant_names)] // protocol names
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::InvalidQos(value)),
        }
    }
}

/// One MQTT control packet, either built by the encoder or decoded from the
/// wire.
///
/// `raw` is always the exact wire encoding of the packet. The only mutation
/// allowed after construction is [`Packet::set_dup`], which rewrites both the
/// command byte and `raw`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub(crate) kind: PacketType,
    pub(crate) command: u8,
    pub(crate) packet_id: Option<u16>,
    pub(crate) topic: Option<String>,
    pub(crate) payload: Bytes,
    pub(crate) qos: QoS,
    pub(crate) return_codes: Vec<u8>,
    pub(crate) session_present: bool,
    pub(crate) raw: Bytes,
}

impl Packet {
    /// A packet with no fields beyond its command byte. `raw` must be non-empty.
    pub(crate) fn bare(kind: PacketType, raw: Bytes) -> Self {
        Self {
            kind,
            command: raw[0],
            packet_id: None,
            topic: None,
            payload: Bytes::new(),
            qos: QoS::AtMostOnce,
            return_codes: Vec::new(),
            session_present: false,
            raw,
        }
    }

    pub fn packet_type(&self) -> PacketType {
        self.kind
    }

    /// Full command byte including flags.
    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn packet_id(&self) -> Option<u16> {
        self.packet_id
    }

    /// Topic name (PUBLISH) or topic filter (SUBSCRIBE).
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// Raw payload bytes; empty for packets without a payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload as UTF-8, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// QoS of a PUBLISH, or the requested QoS of a SUBSCRIBE.
    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn retain(&self) -> bool {
        self.kind == PacketType::Publish && self.command & RETAIN_BIT != 0
    }

    pub fn dup(&self) -> bool {
        self.command & DUP_BIT != 0
    }

    /// SUBACK return codes, one per subscribed topic.
    pub fn return_codes(&self) -> &[u8] {
        &self.return_codes
    }

    /// CONNACK session-present flag.
    pub fn session_present(&self) -> bool {
        self.session_present
    }

    /// Exact wire encoding.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Number of bytes this packet occupies on the wire.
    pub fn wire_len(&self) -> usize {
        self.raw.len()
    }

    /// Mark this packet as a retransmission.
    ///
    /// Applies to QoS 1/2 PUBLISH, PUBACK, PUBREC and PUBREL. PUBCOMP and
    /// every other type never carry DUP and are left untouched.
    pub fn set_dup(&mut self) {
        let carries_dup = match self.kind {
            PacketType::Publish => self.qos != QoS::AtMostOnce,
            PacketType::Puback | PacketType::Pubrec | PacketType::Pubrel => true,
            _ => false,
        };
        if !carries_dup || self.dup() {
            return;
        }

        let mut raw = BytesMut::from(&self.raw[..]);
        raw[0] |= DUP_BIT;
        self.command = raw[0];
        self.raw = raw.freeze();
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(id) = self.packet_id {
            write!(f, " id={}", id)?;
        }
        if let Some(ref topic) = self.topic {
            write!(f, " topic={:?} qos={}", topic, self.qos as u8)?;
        }
        if self.dup() {
            write!(f, " dup")?;
        }
        if self.retain() {
            write!(f, " retain")?;
        }
        if !self.payload.is_empty() {
            write!(f, " payload={}B", self.payload.len())?;
        }
        Ok(())
    }
}

/// Hex rendering of wire bytes for trace logging.
pub struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Append a 2-byte big-endian length prefix followed by the UTF-8 bytes.
pub fn encode_string(s: &str, buf: &mut Vec<u8>) -> Result<()> {
    encode_binary(s.as_bytes(), buf)
}

/// Append a 2-byte big-endian length prefix followed by `data`.
pub fn encode_binary(data: &[u8], buf: &mut Vec<u8>) -> Result<()> {
    let len = u16::try_from(data.len()).map_err(|_| ProtocolError::StringTooLong(data.len()))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(data);
    Ok(())
}

/// Decode a length-prefixed UTF-8 string from the start of `buf`.
///
/// Returns the string and the number of bytes consumed.
pub fn decode_string(buf: &[u8]) -> Result<(String, usize)> {
    let mut dec = Decoder::new(buf);
    let s = dec.read_string()?;
    Ok((s, dec.pos))
}

/// Size of the first complete frame in `buf`.
///
/// Returns `Ok(None)` while more bytes are needed, and `Err` only when the
/// Remaining Length field is malformed.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let Some((remaining, len_bytes)) = varint::decode(&buf[1..])? else {
        return Ok(None);
    };
    let total = 1 + len_bytes + remaining;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some(total))
}

/// Cursor over a frame body.
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(ProtocolError::IncompletePacket {
                needed: 2,
                have: self.remaining(),
            });
        }
        let val = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(val)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::IncompletePacket {
                needed: len,
                have: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn rest(&mut self) -> &'a [u8] {
        let bytes = &self.buf[self.pos..];
        self.pos = self.buf.len();
        bytes
    }
}

/// Decode and validate one inbound packet from the start of `buf`.
///
/// Only the packets a client receives have handlers (CONNACK, PUBLISH,
/// PUBACK, PUBREC, PUBREL, PUBCOMP, SUBACK, PINGRESP). Every other known
/// type is reported as [`ProtocolError::NotImplemented`].
pub fn decode_packet(buf: &[u8]) -> Result<Packet> {
    if buf.is_empty() {
        return Err(ProtocolError::NoPacket);
    }

    let kind = PacketType::from_command(buf[0])?;
    match kind {
        PacketType::Connack => decode_connack(buf),
        PacketType::Publish => decode_publish(buf),
        PacketType::Puback | PacketType::Pubrec | PacketType::Pubcomp => {
            decode_ack(kind, kind.base_byte(), buf)
        }
        // MQTT-3.6.1-1: PUBREL fixed header flags MUST be 0010
        PacketType::Pubrel => decode_ack(kind, kind.base_byte() | RESERVED_FLAGS, buf),
        PacketType::Suback => decode_suback(buf),
        PacketType::Pingresp => decode_pingresp(buf),
        other => Err(ProtocolError::NotImplemented(other)),
    }
}

/// Check the minimum length and locate the frame.
/// Returns (header_len, total_len).
fn locate_frame(kind: PacketType, buf: &[u8], min_len: usize) -> Result<(usize, usize)> {
    if buf.len() < min_len {
        return Err(ProtocolError::InvalidLength {
            packet: kind,
            expected: min_len,
            actual: buf.len(),
        });
    }

    let Some((remaining, len_bytes)) = varint::decode(&buf[1..])? else {
        return Err(ProtocolError::MalformedLength("incomplete data"));
    };

    let header_len = 1 + len_bytes;
    let total_len = header_len + remaining;
    if buf.len() < total_len {
        return Err(ProtocolError::IncompletePacket {
            needed: total_len,
            have: buf.len(),
        });
    }
    Ok((header_len, total_len))
}

fn expect_header(expected: u8, actual: u8) -> Result<()> {
    if expected != actual {
        return Err(ProtocolError::InvalidHeader { expected, actual });
    }
    Ok(())
}

fn decode_connack(buf: &[u8]) -> Result<Packet> {
    let kind = PacketType::Connack;
    if buf.len() < 4 {
        return Err(ProtocolError::InvalidLength {
            packet: kind,
            expected: 4,
            actual: buf.len(),
        });
    }
    expect_header(kind.base_byte(), buf[0])?;
    let (header_len, total_len) = locate_frame(kind, buf, 4)?;
    if total_len - header_len < 2 {
        return Err(ProtocolError::InvalidLength {
            packet: kind,
            expected: 2,
            actual: total_len - header_len,
        });
    }

    let flags = buf[header_len];
    let code = buf[header_len + 1];
    if code != 0x00 {
        return Err(ProtocolError::ConnectRefused(ConnectRefusal::from_code(code)));
    }

    let mut packet = Packet::bare(kind, Bytes::copy_from_slice(&buf[..total_len]));
    packet.session_present = flags & 0x01 != 0;
    Ok(packet)
}

fn decode_publish(buf: &[u8]) -> Result<Packet> {
    let kind = PacketType::Publish;
    if buf.len() < 4 {
        return Err(ProtocolError::InvalidLength {
            packet: kind,
            expected: 4,
            actual: buf.len(),
        });
    }

    let command = buf[0];
    let qos_bits = (command & QOS_MASK) >> 1;
    let qos = QoS::try_from(qos_bits)?;

    let (header_len, total_len) = locate_frame(kind, buf, 4)?;
    let mut dec = Decoder::new(&buf[header_len..total_len]);

    let topic = dec.read_string()?;
    let packet_id = if qos != QoS::AtMostOnce {
        match dec.read_u16()? {
            0 => return Err(ProtocolError::ZeroPacketId(kind)),
            id => Some(id),
        }
    } else {
        None
    };
    let payload = Bytes::copy_from_slice(dec.rest());

    let mut packet = Packet::bare(kind, Bytes::copy_from_slice(&buf[..total_len]));
    packet.topic = Some(topic);
    packet.packet_id = packet_id;
    packet.qos = qos;
    packet.payload = payload;
    Ok(packet)
}

/// PUBACK, PUBREC, PUBREL, PUBCOMP: exactly four bytes, exact header,
/// remaining length 2.
fn decode_ack(kind: PacketType, header: u8, buf: &[u8]) -> Result<Packet> {
    if buf.len() != 4 {
        return Err(ProtocolError::InvalidLength {
            packet: kind,
            expected: 4,
            actual: buf.len(),
        });
    }
    expect_header(header, buf[0])?;
    if buf[1] != 0x02 {
        return Err(ProtocolError::InvalidLength {
            packet: kind,
            expected: 2,
            actual: buf[1] as usize,
        });
    }

    let mut packet = Packet::bare(kind, Bytes::copy_from_slice(buf));
    packet.packet_id = Some(u16::from_be_bytes([buf[2], buf[3]]));
    Ok(packet)
}

fn decode_suback(buf: &[u8]) -> Result<Packet> {
    let kind = PacketType::Suback;
    if buf.len() < 5 {
        return Err(ProtocolError::InvalidLength {
            packet: kind,
            expected: 5,
            actual: buf.len(),
        });
    }
    expect_header(kind.base_byte(), buf[0])?;
    let (header_len, total_len) = locate_frame(kind, buf, 5)?;

    let mut dec = Decoder::new(&buf[header_len..total_len]);
    let packet_id = dec.read_u16()?;
    let return_codes = dec.rest().to_vec();
    if let Some(&bad) = return_codes.iter().find(|&&code| code > 0x02) {
        return Err(ProtocolError::InvalidSubackCode(bad));
    }

    let mut packet = Packet::bare(kind, Bytes::copy_from_slice(&buf[..total_len]));
    packet.packet_id = Some(packet_id);
    packet.return_codes = return_codes;
    Ok(packet)
}

fn decode_pingresp(buf: &[u8]) -> Result<Packet> {
    let kind = PacketType::Pingresp;
    let (_, total_len) = locate_frame(kind, buf, 2)?;
    Ok(Packet::bare(kind, Bytes::copy_from_slice(&buf[..total_len])))
}
