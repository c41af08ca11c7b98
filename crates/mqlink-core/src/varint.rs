//! Remaining Length encoding/decoding for MQTT.
//!
//! The fixed header carries the number of bytes that follow it as a base-128
//! integer: 7 value bits per byte, least significant group first, with the
//! high bit set when another byte follows. At most four bytes are allowed:
//! - 0-127: 1 byte
//! - 128-16383: 2 bytes
//! - 16384-2097151: 3 bytes
//! - 2097152-268435455: 4 bytes

use crate::error::{ProtocolError, Result};

/// Largest value that fits in four Remaining Length bytes.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Decode a Remaining Length field from the start of `buf`.
///
/// Returns `Ok(Some((value, bytes_consumed)))` if successful,
/// `Ok(None)` if the input ends before the continuation bit clears,
/// or `Err` if the field would need more than four bytes.
///
/// # Example
/// ```
/// use mqlink_core::varint::decode;
/// let buf = [0x80, 0x01]; // Encodes 128
/// let (value, consumed) = decode(&buf).unwrap().unwrap();
/// assert_eq!(value, 128);
/// assert_eq!(consumed, 2);
/// ```
pub fn decode(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut multiplier = 1usize;
    let mut value = 0usize;

    for (i, &byte) in buf.iter().enumerate() {
        if multiplier > 128 * 128 * 128 {
            return Err(ProtocolError::MalformedLength("length too long"));
        }

        value += ((byte & 0x7F) as usize) * multiplier;

        if (byte & 0x80) == 0 {
            return Ok(Some((value, i + 1)));
        }

        multiplier *= 128;
    }

    if multiplier > 128 * 128 * 128 {
        return Err(ProtocolError::MalformedLength("length too long"));
    }

    // Need more bytes
    Ok(None)
}

/// Encode a value as a Remaining Length field, appending to a Vec.
///
/// Returns the number of bytes written. Callers keep `value` at or below
/// [`MAX_REMAINING_LENGTH`].
///
/// # Example
/// ```
/// use mqlink_core::varint::encode_to_vec;
/// let mut buf = Vec::new();
/// let written = encode_to_vec(300, &mut buf);
/// assert_eq!(written, 2);
/// assert_eq!(&buf, &[0xAC, 0x02]);
/// ```
pub fn encode_to_vec(mut value: usize, buf: &mut Vec<u8>) -> usize {
    let start = buf.len();
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
    buf.len() - start
}

/// Calculate the number of bytes needed to encode a value.
///
/// # Example
/// ```
/// use mqlink_core::varint::encoded_len;
/// assert_eq!(encoded_len(0), 1);
/// assert_eq!(encoded_len(127), 1);
/// assert_eq!(encoded_len(128), 2);
/// assert_eq!(encoded_len(16383), 2);
/// assert_eq!(encoded_len(16384), 3);
/// ```
pub fn encoded_len(mut value: usize) -> usize {
    let mut len = 0;
    loop {
        len += 1;
        value /= 128;
        if value == 0 {
            break;
        }
    }
    len
}
