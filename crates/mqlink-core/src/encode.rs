//! Outbound packet encoding.
//!
//! Every encoder returns a [`Packet`] whose `raw` bytes are ready to write to
//! the socket. Encoders that draw a packet identifier live on
//! [`PacketEncoder`]; the acknowledgement packets only echo an identifier and
//! are free functions.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::packet::{
    encode_binary, encode_string, Packet, PacketType, QoS, DUP_BIT, RESERVED_FLAGS, RETAIN_BIT,
};
use crate::packet_id::PacketIdGenerator;
use crate::varint::{self, MAX_REMAINING_LENGTH};

/// Protocol name carried by CONNECT.
pub const PROTOCOL_NAME: &str = "MQTT";
/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 0x04;

/// Last Will and Testament carried by CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNECT packet fields.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<LastWill>,
}

/// Encoder for packets that need a fresh packet identifier.
///
/// Each connection owns one encoder, so identifiers are never shared between
/// independent connections.
#[derive(Debug, Default)]
pub struct PacketEncoder {
    ids: PacketIdGenerator,
}

impl PacketEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifier the next PUBLISH (QoS > 0) or SUBSCRIBE will carry.
    pub fn peek_packet_id(&self) -> u16 {
        self.ids.peek()
    }

    /// Restart identifiers at 1.
    pub fn reset(&mut self) {
        self.ids.reset();
    }

    /// Encode a PUBLISH packet. QoS 1/2 publishes take the next identifier.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        dup: bool,
    ) -> Result<Packet> {
        let mut command = PacketType::Publish.base_byte() | ((qos as u8) << 1);
        if retain {
            command |= RETAIN_BIT;
        }
        if dup {
            command |= DUP_BIT;
        }

        let mut body = Vec::with_capacity(2 + topic.len() + 2 + payload.len());
        encode_string(topic, &mut body)?;

        let packet_id = if qos != QoS::AtMostOnce {
            let id = self.ids.next_id();
            body.extend_from_slice(&id.to_be_bytes());
            Some(id)
        } else {
            None
        };
        body.extend_from_slice(payload);

        let mut packet = Packet::bare(PacketType::Publish, frame(command, &body)?);
        packet.packet_id = packet_id;
        packet.topic = Some(topic.to_owned());
        packet.payload = Bytes::copy_from_slice(payload);
        packet.qos = qos;
        Ok(packet)
    }

    /// Encode a single-topic SUBSCRIBE packet.
    pub fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<Packet> {
        // Validate the topic before spending an identifier
        let mut filter = Vec::with_capacity(2 + topic.len() + 1);
        encode_string(topic, &mut filter)?;
        filter.push(qos as u8);

        let id = self.ids.next_id();
        let mut body = Vec::with_capacity(2 + filter.len());
        body.extend_from_slice(&id.to_be_bytes());
        body.extend_from_slice(&filter);

        // MQTT-3.8.1-1: SUBSCRIBE fixed header flags MUST be 0010
        let command = PacketType::Subscribe.base_byte() | RESERVED_FLAGS;
        let mut packet = Packet::bare(PacketType::Subscribe, frame(command, &body)?);
        packet.packet_id = Some(id);
        packet.topic = Some(topic.to_owned());
        packet.qos = qos;
        Ok(packet)
    }
}

/// Encode a CONNECT packet.
pub fn encode_connect(options: &ConnectOptions) -> Result<Packet> {
    let mut body = Vec::new();

    encode_string(PROTOCOL_NAME, &mut body)?;
    body.push(PROTOCOL_LEVEL);

    let mut flags = 0u8;
    if options.clean_session {
        flags |= 0x02;
    }
    if let Some(ref will) = options.will {
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if options.password.is_some() {
        flags |= 0x40;
    }
    if options.username.is_some() {
        flags |= 0x80;
    }
    body.push(flags);
    body.extend_from_slice(&options.keep_alive.to_be_bytes());

    // Payload order is fixed: client id, will topic, will message, username, password
    encode_string(&options.client_id, &mut body)?;
    if let Some(ref will) = options.will {
        encode_string(&will.topic, &mut body)?;
        encode_binary(&will.message, &mut body)?;
    }
    if let Some(ref username) = options.username {
        encode_string(username, &mut body)?;
    }
    if let Some(ref password) = options.password {
        encode_binary(password, &mut body)?;
    }

    let command = PacketType::Connect.base_byte();
    Ok(Packet::bare(PacketType::Connect, frame(command, &body)?))
}

pub fn encode_puback(packet_id: u16, dup: bool) -> Packet {
    let command = with_dup(PacketType::Puback.base_byte(), dup);
    id_only(PacketType::Puback, command, packet_id)
}

pub fn encode_pubrec(packet_id: u16, dup: bool) -> Packet {
    let command = with_dup(PacketType::Pubrec.base_byte(), dup);
    id_only(PacketType::Pubrec, command, packet_id)
}

/// PUBREL always carries the reserved `0010` flags, with or without DUP.
pub fn encode_pubrel(packet_id: u16, dup: bool) -> Packet {
    let command = with_dup(PacketType::Pubrel.base_byte() | RESERVED_FLAGS, dup);
    id_only(PacketType::Pubrel, command, packet_id)
}

/// PUBCOMP never carries DUP.
pub fn encode_pubcomp(packet_id: u16) -> Packet {
    id_only(PacketType::Pubcomp, PacketType::Pubcomp.base_byte(), packet_id)
}

pub fn encode_pingreq() -> Packet {
    let raw = Bytes::from(vec![PacketType::Pingreq.base_byte(), 0x00]);
    Packet::bare(PacketType::Pingreq, raw)
}

pub fn encode_disconnect() -> Packet {
    let raw = Bytes::from(vec![PacketType::Disconnect.base_byte(), 0x00]);
    Packet::bare(PacketType::Disconnect, raw)
}

fn with_dup(command: u8, dup: bool) -> u8 {
    if dup {
        command | DUP_BIT
    } else {
        command
    }
}

fn id_only(kind: PacketType, command: u8, packet_id: u16) -> Packet {
    let [hi, lo] = packet_id.to_be_bytes();
    let raw = Bytes::from(vec![command, 0x02, hi, lo]);
    let mut packet = Packet::bare(kind, raw);
    packet.packet_id = Some(packet_id);
    packet
}

/// Prefix `body` with the command byte and its Remaining Length.
fn frame(command: u8, body: &[u8]) -> Result<Bytes> {
    if body.len() > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::PacketTooLarge(body.len()));
    }
    let mut buf = Vec::with_capacity(1 + varint::encoded_len(body.len()) + body.len());
    buf.push(command);
    varint::encode_to_vec(body.len(), &mut buf);
    buf.extend_from_slice(body);
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::decode_packet;

    #[test]
    fn test_connect_minimal() {
        let packet = encode_connect(&ConnectOptions {
            client_id: "test".to_string(),
            keep_alive: 60,
            clean_session: true,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(
            packet.raw().as_ref(),
            &[
                0x10, 0x10, // fixed header
                0x00, 0x04, b'M', b'Q', b'T', b'T', // protocol name
                0x04, // level
                0x02, // flags: clean session
                0x00, 0x3C, // keep alive
                0x00, 0x04, b't', b'e', b's', b't', // client id
            ]
        );
        assert_eq!(packet.packet_type(), PacketType::Connect);
    }

    #[test]
    fn test_connect_full_flags_and_payload_order() {
        let packet = encode_connect(&ConnectOptions {
            client_id: "c".to_string(),
            keep_alive: 10,
            clean_session: true,
            username: Some("u".to_string()),
            password: Some(b"p".to_vec()),
            will: Some(LastWill {
                topic: "w".to_string(),
                message: Bytes::from_static(b"bye"),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
        })
        .unwrap();

        let raw = packet.raw();
        assert_eq!(raw[0], 0x10);
        assert_eq!(raw[9], 0xEE);
        assert_eq!(
            &raw[12..],
            &[
                0x00, 0x01, b'c', // client id
                0x00, 0x01, b'w', // will topic
                0x00, 0x03, b'b', b'y', b'e', // will message
                0x00, 0x01, b'u', // username
                0x00, 0x01, b'p', // password
            ]
        );
        assert_eq!(raw[1] as usize, raw.len() - 2);
    }

    #[test]
    fn test_connect_will_qos2_without_retain() {
        let packet = encode_connect(&ConnectOptions {
            client_id: "c".to_string(),
            will: Some(LastWill {
                topic: "w".to_string(),
                message: Bytes::new(),
                qos: QoS::ExactlyOnce,
                retain: false,
            }),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(packet.raw()[9], 0x04 | 0x10);
    }

    #[test]
    fn test_publish_then_decode() {
        let mut encoder = PacketEncoder::new();
        let sent = encoder
            .publish("a/", b"hi", QoS::AtLeastOnce, false, false)
            .unwrap();
        let id = sent.packet_id().unwrap();

        let received = decode_packet(sent.raw()).unwrap();
        assert_eq!(received.topic(), Some("a/"));
        assert_eq!(received.payload_str(), Some("hi"));
        assert_eq!(received.qos(), QoS::AtLeastOnce);
        assert_eq!(received.packet_id(), Some(id));
        assert_eq!(received, sent);
    }

    #[test]
    fn test_publish_command_byte() {
        let mut encoder = PacketEncoder::new();
        let packet = encoder
            .publish("t", b"", QoS::ExactlyOnce, true, true)
            .unwrap();
        assert_eq!(packet.command(), 0x30 | 0x04 | 0x01 | 0x08);
        assert!(packet.dup());
        assert!(packet.retain());
    }

    #[test]
    fn test_publish_qos0_has_no_id() {
        let mut encoder = PacketEncoder::new();
        let packet = encoder
            .publish("t", b"x", QoS::AtMostOnce, false, false)
            .unwrap();
        assert_eq!(packet.packet_id(), None);
        assert_eq!(packet.raw().as_ref(), &[0x30, 0x04, 0x00, 0x01, b't', b'x']);
        assert_eq!(encoder.peek_packet_id(), 1);
    }

    #[test]
    fn test_numeric_payload_is_stringified_by_caller() {
        let mut encoder = PacketEncoder::new();
        let packet = encoder
            .publish("n", 42.to_string().as_bytes(), QoS::AtMostOnce, false, false)
            .unwrap();
        assert_eq!(packet.payload_str(), Some("42"));
    }

    #[test]
    fn test_ids_advance_across_publish_and_subscribe() {
        let mut encoder = PacketEncoder::new();
        let a = encoder.publish("t", b"", QoS::AtLeastOnce, false, false).unwrap();
        let b = encoder.subscribe("t", QoS::AtMostOnce).unwrap();
        let c = encoder.publish("t", b"", QoS::ExactlyOnce, false, false).unwrap();
        assert_eq!(a.packet_id(), Some(1));
        assert_eq!(b.packet_id(), Some(2));
        assert_eq!(c.packet_id(), Some(3));
    }

    #[test]
    fn test_subscribe() {
        let mut encoder = PacketEncoder::new();
        let packet = encoder.subscribe("a/b", QoS::ExactlyOnce).unwrap();
        assert_eq!(
            packet.raw().as_ref(),
            &[0x82, 0x08, 0x00, 0x01, 0x00, 0x03, b'a', b'/', b'b', 0x02]
        );
        assert_eq!(packet.topic(), Some("a/b"));
        assert_eq!(packet.qos(), QoS::ExactlyOnce);
    }

    #[test]
    fn test_topic_too_long_is_rejected() {
        let mut encoder = PacketEncoder::new();
        let topic = "t".repeat(70_000);
        assert_eq!(
            encoder.subscribe(&topic, QoS::AtMostOnce),
            Err(ProtocolError::StringTooLong(70_000))
        );
        assert_eq!(encoder.peek_packet_id(), 1);
    }

    #[test]
    fn test_acks() {
        assert_eq!(encode_puback(7, false).raw().as_ref(), &[0x40, 0x02, 0x00, 0x07]);
        assert_eq!(encode_puback(7, true).raw().as_ref(), &[0x48, 0x02, 0x00, 0x07]);
        assert_eq!(encode_pubrec(0x0102, false).raw().as_ref(), &[0x50, 0x02, 0x01, 0x02]);
        assert_eq!(encode_pubrec(1, true).raw()[0], 0x58);
        assert_eq!(encode_pubcomp(1).raw().as_ref(), &[0x70, 0x02, 0x00, 0x01]);
    }

    #[test]
    fn test_pubrel_keeps_reserved_flags() {
        assert_eq!(encode_pubrel(1, false).raw().as_ref(), &[0x62, 0x02, 0x00, 0x01]);
        assert_eq!(encode_pubrel(1, true).raw()[0], 0x6A);
        assert_eq!(encode_pubrel(1, true).packet_id(), Some(1));
    }

    #[test]
    fn test_ack_decodes_back() {
        for packet in [
            encode_puback(9, false),
            encode_pubrec(9, false),
            encode_pubrel(9, false),
            encode_pubcomp(9),
        ] {
            assert_eq!(decode_packet(packet.raw()).unwrap(), packet);
        }
    }

    #[test]
    fn test_ping_and_disconnect() {
        assert_eq!(encode_pingreq().raw().as_ref(), &[0xC0, 0x00]);
        assert_eq!(encode_disconnect().raw().as_ref(), &[0xE0, 0x00]);
    }
}
