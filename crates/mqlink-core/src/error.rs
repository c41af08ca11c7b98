//! Protocol error types.

use thiserror::Error;

use crate::packet::PacketType;

/// CONNACK refusal reasons (MQTT 3.1.1 return codes 0x01-0x05).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectRefusal {
    #[error("unacceptable protocol version")]
    UnacceptableProtocolVersion,

    #[error("identifier rejected")]
    IdentifierRejected,

    #[error("broker unavailable")]
    BrokerUnavailable,

    #[error("bad username or password")]
    BadUsernameOrPassword,

    #[error("not authorized")]
    NotAuthorized,

    #[error("unknown return code {0:#04x}")]
    Unknown(u8),
}

impl ConnectRefusal {
    /// Map a non-zero CONNACK return code to its refusal reason.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => ConnectRefusal::UnacceptableProtocolVersion,
            0x02 => ConnectRefusal::IdentifierRejected,
            0x03 => ConnectRefusal::BrokerUnavailable,
            0x04 => ConnectRefusal::BadUsernameOrPassword,
            0x05 => ConnectRefusal::NotAuthorized,
            other => ConnectRefusal::Unknown(other),
        }
    }
}

/// MQTT protocol errors raised while encoding or decoding packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("No packet to handle")]
    NoPacket,

    #[error("Unknown command byte: {0:#04x}")]
    UnknownCommand(u8),

    #[error("Malformed remaining length: {0}")]
    MalformedLength(&'static str),

    #[error("Incomplete packet: need {needed} bytes, have {have}")]
    IncompletePacket { needed: usize, have: usize },

    #[error("Invalid fixed header: expected {expected:#04x}, got {actual:#04x}")]
    InvalidHeader { expected: u8, actual: u8 },

    #[error("Invalid {packet:?} length: expected {expected}, got {actual}")]
    InvalidLength {
        packet: PacketType,
        expected: usize,
        actual: usize,
    },

    #[error("Connection refused: {0}")]
    ConnectRefused(ConnectRefusal),

    #[error("Invalid QoS: {0}")]
    InvalidQos(u8),

    #[error("Packet identifier 0 in {0:?}")]
    ZeroPacketId(PacketType),

    #[error("Invalid SUBACK return code: {0:#04x}")]
    InvalidSubackCode(u8),

    #[error("Handler not implemented for {0:?}")]
    NotImplemented(PacketType),

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("String too long for a length prefix: {0} bytes")]
    StringTooLong(usize),

    #[error("Packet too large: remaining length {0}")]
    PacketTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refusal_codes_are_distinct() {
        let refusals: Vec<_> = (0x01..=0x05).map(ConnectRefusal::from_code).collect();
        for (i, a) in refusals.iter().enumerate() {
            for b in &refusals[i + 1..] {
                assert_ne!(a, b);
            }
            assert!(!matches!(a, ConnectRefusal::Unknown(_)));
        }
    }

    #[test]
    fn test_unmapped_code_is_unknown() {
        assert_eq!(ConnectRefusal::from_code(0x06), ConnectRefusal::Unknown(0x06));
        assert_eq!(ConnectRefusal::from_code(0xFF), ConnectRefusal::Unknown(0xFF));
    }
}
