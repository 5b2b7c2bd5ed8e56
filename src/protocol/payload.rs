//! Inner payload codecs and convenience frame builders.
//!
//! Payloads are flat field sequences: each field is a one-byte length
//! followed by that many bytes. Field values are UTF-8 strings by
//! convention but are not semantically validated here.

use super::codec::encode;
use super::{FrameType, PeerFamily, ProtocolError};

/// CONNECT payload: the identity handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectData {
    pub tenant_code: String,
    pub user_code: String,
    pub source: String,
}

/// MESSAGE payload: one seat/power event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageData {
    pub tenant_code: String,
    pub user_code: String,
    pub source: String,
    pub room_code: String,
    pub seat_number: String,
    pub power_number: String,
    pub timestamp: String,
}

/// Append one length-prefixed field. Values longer than 255 bytes are
/// truncated: the length prefix is a single byte.
fn put_field(buf: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(u8::MAX as usize);
    buf.push(len as u8);
    buf.extend_from_slice(&bytes[..len]);
}

/// Cursor over a payload buffer that pops length-prefixed fields.
struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read(&mut self, name: &'static str) -> Result<String, ProtocolError> {
        let len = *self
            .data
            .get(self.pos)
            .ok_or(ProtocolError::BadPayload(name))? as usize;
        self.pos += 1;

        let end = self.pos + len;
        if end > self.data.len() {
            return Err(ProtocolError::BadPayload(name));
        }
        let value = String::from_utf8_lossy(&self.data[self.pos..end]).into_owned();
        self.pos = end;
        Ok(value)
    }
}

/// Encode a CONNECT payload.
#[must_use]
pub fn encode_connect_data(tenant_code: &str, user_code: &str, source: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(3 + tenant_code.len() + user_code.len() + source.len());
    put_field(&mut buf, tenant_code);
    put_field(&mut buf, user_code);
    put_field(&mut buf, source);
    buf
}

/// Decode a CONNECT payload.
///
/// # Errors
///
/// [`ProtocolError::BadPayload`] naming the field whose declared length
/// overflows the buffer.
pub fn decode_connect_data(data: &[u8]) -> Result<ConnectData, ProtocolError> {
    let mut reader = FieldReader::new(data);
    Ok(ConnectData {
        tenant_code: reader.read("tenant_code")?,
        user_code: reader.read("user_code")?,
        source: reader.read("source")?,
    })
}

/// Encode a MESSAGE payload.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn encode_message_data(
    tenant_code: &str,
    user_code: &str,
    source: &str,
    room_code: &str,
    seat_number: &str,
    power_number: &str,
    timestamp: &str,
) -> Vec<u8> {
    let mut buf = Vec::new();
    put_field(&mut buf, tenant_code);
    put_field(&mut buf, user_code);
    put_field(&mut buf, source);
    put_field(&mut buf, room_code);
    put_field(&mut buf, seat_number);
    put_field(&mut buf, power_number);
    put_field(&mut buf, timestamp);
    buf
}

/// Decode a MESSAGE payload.
///
/// # Errors
///
/// [`ProtocolError::BadPayload`] naming the overflowing field.
pub fn decode_message_data(data: &[u8]) -> Result<MessageData, ProtocolError> {
    let mut reader = FieldReader::new(data);
    Ok(MessageData {
        tenant_code: reader.read("tenant_code")?,
        user_code: reader.read("user_code")?,
        source: reader.read("source")?,
        room_code: reader.read("room_code")?,
        seat_number: reader.read("seat_number")?,
        power_number: reader.read("power_number")?,
        timestamp: reader.read("timestamp")?,
    })
}

/// Encode a WELCOME payload.
#[must_use]
pub fn encode_welcome_data(message_text: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + message_text.len());
    put_field(&mut buf, message_text);
    buf
}

/// Decode a WELCOME payload.
///
/// # Errors
///
/// [`ProtocolError::BadPayload`] if the text overflows the buffer.
pub fn decode_welcome_data(data: &[u8]) -> Result<String, ProtocolError> {
    FieldReader::new(data).read("message_text")
}

// ---------------------------------------------------------------------------
// Frame builders
// ---------------------------------------------------------------------------

/// Auth family for a frame whose `source` field names the sender.
/// Anything other than `"desk"` / `"device"` encodes as desk.
fn family_for_source(source: &str) -> PeerFamily {
    PeerFamily::from_source(source)
}

/// Build a complete CONNECT frame, auth family chosen from `source`.
#[must_use]
pub fn connect_frame(tenant_code: &str, user_code: &str, source: &str) -> Vec<u8> {
    let data = encode_connect_data(tenant_code, user_code, source);
    encode(FrameType::Connect, &data, family_for_source(source))
}

/// Build a complete MESSAGE frame, auth family chosen from `source`.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn message_frame(
    tenant_code: &str,
    user_code: &str,
    source: &str,
    room_code: &str,
    seat_number: &str,
    power_number: &str,
    timestamp: &str,
) -> Vec<u8> {
    let data = encode_message_data(
        tenant_code,
        user_code,
        source,
        room_code,
        seat_number,
        power_number,
        timestamp,
    );
    encode(FrameType::Message, &data, family_for_source(source))
}

/// Build an empty PING frame for the given family.
#[must_use]
pub fn ping_frame(family: PeerFamily) -> Vec<u8> {
    encode(FrameType::Ping, &[], family)
}

/// Build an empty PONG frame for the given family.
#[must_use]
pub fn pong_frame(family: PeerFamily) -> Vec<u8> {
    encode(FrameType::Pong, &[], family)
}

/// Build a WELCOME frame for the given family.
#[must_use]
pub fn welcome_frame(message_text: &str, family: PeerFamily) -> Vec<u8> {
    encode(FrameType::Welcome, &encode_welcome_data(message_text), family)
}
