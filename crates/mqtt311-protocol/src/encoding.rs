//! Wire-level primitives: the variable-byte-integer used by the
//! remaining-length field and the length-prefixed strings/binary blobs
//! that make up packet bodies.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{MqttError, Result};

/// Largest value representable by the four-byte remaining-length field.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Largest UTF-8 string / binary field (two-byte length prefix).
pub const MAX_STRING_LENGTH: usize = 65_535;

/// Encode a remaining-length value using the 7-bits-per-byte continuation
/// scheme.
pub fn encode_remaining_length(value: usize, buf: &mut BytesMut) -> Result<()> {
    if value > MAX_REMAINING_LENGTH {
        return Err(MqttError::PacketTooLarge(value));
    }
    let mut remaining = value;
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if remaining == 0 {
            return Ok(());
        }
    }
}

/// Decode a remaining-length value.
///
/// Returns `Ok(Some((value, bytes_consumed)))` on success and `Ok(None)`
/// when the encoding has not terminated within the available bytes. An
/// encoding that would exceed four bytes is a framing error: the packet
/// boundary can no longer be recovered, so the error is the fatal
/// `ProtocolError` rather than a skippable `MalformedPacket`.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut multiplier = 1usize;
    let mut value = 0usize;

    for (i, &byte) in buf.iter().enumerate() {
        if i >= 4 {
            return Err(MqttError::ProtocolError(
                "remaining length exceeds four bytes".to_string(),
            ));
        }
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }

    Ok(None)
}

/// Number of bytes `encode_remaining_length` will produce for `value`.
#[must_use]
pub fn remaining_length_size(mut value: usize) -> usize {
    let mut len = 0;
    loop {
        len += 1;
        value /= 128;
        if value == 0 {
            return len;
        }
    }
}

/// Write a UTF-8 string with its two-byte length prefix.
pub fn write_string(value: &str, buf: &mut BytesMut) -> Result<()> {
    write_bytes(value.as_bytes(), buf)
}

/// Write a binary field with its two-byte length prefix.
pub fn write_bytes(value: &[u8], buf: &mut BytesMut) -> Result<()> {
    if value.len() > MAX_STRING_LENGTH {
        return Err(MqttError::StringTooLong(value.len()));
    }
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
    Ok(())
}

pub fn read_u8(buf: &mut Bytes) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(MqttError::MalformedPacket("truncated byte field".to_string()));
    }
    Ok(buf.get_u8())
}

pub fn read_u16(buf: &mut Bytes) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(
            "truncated two-byte field".to_string(),
        ));
    }
    Ok(buf.get_u16())
}

/// Read a length-prefixed UTF-8 string.
///
/// The null character is forbidden in MQTT strings, and invalid UTF-8 is
/// a malformed packet.
pub fn read_string(buf: &mut Bytes) -> Result<String> {
    let bytes = read_binary(buf)?;
    if bytes.contains(&0) {
        return Err(MqttError::MalformedPacket(
            "string contains null character".to_string(),
        ));
    }
    String::from_utf8(bytes.to_vec())
        .map_err(|_| MqttError::MalformedPacket("invalid UTF-8 string".to_string()))
}

/// Read a length-prefixed binary field.
pub fn read_binary(buf: &mut Bytes) -> Result<Bytes> {
    let len = usize::from(read_u16(buf)?);
    if buf.remaining() < len {
        return Err(MqttError::MalformedPacket(format!(
            "length prefix {len} exceeds {} available bytes",
            buf.remaining()
        )));
    }
    Ok(buf.split_to(len))
}
