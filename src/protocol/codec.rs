//! Frame envelope codec: auth checksums, encode/decode, stream reassembly.
//!
//! Decoding determines the sender family by attempting the desk checksum
//! first, then the device checksum. Encoding draws three fresh random bytes
//! per frame, so the auth prefix is effectively nonced.

use crate::constants::MAX_FRAME_SIZE;

use super::{Frame, FrameType, PeerFamily, ProtocolError, MIN_FRAME_LEN};

/// Legacy minimal ping a device may send before speaking the full protocol:
/// bare type byte 3 with a zero length and no auth prefix.
pub const LEGACY_PING: [u8; 5] = [3, 0, 0, 0, 0];

/// The reply to [`LEGACY_PING`], in the same bare format.
pub const LEGACY_PONG: [u8; 5] = [4, 0, 0, 0, 0];

/// Desk checksum: `b4 = (b1 + b2 + b3) mod 256`.
fn desk_checksum(b: [u8; 3]) -> u8 {
    b[0].wrapping_add(b[1]).wrapping_add(b[2])
}

/// Device checksum: `b4 = ((b1 + b2) mod 256) XOR b3`.
fn device_checksum(b: [u8; 3]) -> u8 {
    b[0].wrapping_add(b[1]) ^ b[2]
}

/// Validate an auth prefix against one family's checksum rule.
fn validate_auth(auth: [u8; 4], family: PeerFamily) -> bool {
    let head = [auth[0], auth[1], auth[2]];
    let expected = match family {
        PeerFamily::Desk => desk_checksum(head),
        PeerFamily::Device => device_checksum(head),
    };
    auth[3] == expected
}

/// Generate a fresh nonced auth prefix for the given family.
fn generate_auth(family: PeerFamily) -> [u8; 4] {
    let head: [u8; 3] = rand::random();
    let tail = match family {
        PeerFamily::Desk => desk_checksum(head),
        PeerFamily::Device => device_checksum(head),
    };
    [head[0], head[1], head[2], tail]
}

/// Encode a frame for the given recipient family.
///
/// Layout: `[auth:4][type:1][len:4 BE][data]`. Infallible.
#[must_use]
pub fn encode(frame_type: FrameType, data: &[u8], family: PeerFamily) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MIN_FRAME_LEN + data.len());
    buf.extend_from_slice(&generate_auth(family));
    buf.push(frame_type as u8);
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Decode a frame, returning it together with the family its auth prefix
/// was produced for.
///
/// # Errors
///
/// - [`ProtocolError::BadFrame`] if fewer than 9 bytes are available.
/// - [`ProtocolError::BadAuth`] if neither checksum matches.
/// - [`ProtocolError::UnknownType`] for an unrecognized type byte.
/// - [`ProtocolError::BadLength`] if the declared payload length exceeds
///   the remaining bytes.
pub fn decode(bytes: &[u8]) -> Result<(Frame, PeerFamily), ProtocolError> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(ProtocolError::BadFrame(bytes.len()));
    }

    let auth = [bytes[0], bytes[1], bytes[2], bytes[3]];
    let family = if validate_auth(auth, PeerFamily::Desk) {
        PeerFamily::Desk
    } else if validate_auth(auth, PeerFamily::Device) {
        PeerFamily::Device
    } else {
        return Err(ProtocolError::BadAuth);
    };

    let frame_type =
        FrameType::from_u8(bytes[4]).ok_or(ProtocolError::UnknownType(bytes[4]))?;

    let declared = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
    let available = bytes.len() - MIN_FRAME_LEN;
    if declared > available {
        return Err(ProtocolError::BadLength { declared, available });
    }

    Ok((
        Frame {
            auth,
            frame_type,
            data: bytes[MIN_FRAME_LEN..MIN_FRAME_LEN + declared].to_vec(),
        },
        family,
    ))
}

/// One unit extracted from a TCP byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A complete frame, still in wire form (auth unvalidated).
    Frame(Vec<u8>),
    /// The legacy 5-byte ping shortcut; answer with [`LEGACY_PONG`].
    LegacyPing,
}

/// Incremental frame assembler for stream transports.
///
/// TCP delivers arbitrary byte chunks; feed them in and extract complete
/// frames. The assembler also recognizes the [`LEGACY_PING`] shortcut,
/// which cannot collide with a real frame: an auth prefix of `[3,0,0,0]`
/// satisfies neither family checksum.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
}

impl FrameAssembler {
    /// Create an assembler with an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and extract every complete unit.
    ///
    /// Incomplete trailing bytes stay buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BadLength`] when a header declares a payload
    /// larger than [`MAX_FRAME_SIZE`]. The stream is unrecoverable at that
    /// point; callers must drop the connection.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Inbound>, ProtocolError> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        loop {
            if self.buf.len() >= LEGACY_PING.len() && self.buf[..LEGACY_PING.len()] == LEGACY_PING {
                self.buf.drain(..LEGACY_PING.len());
                out.push(Inbound::LegacyPing);
                continue;
            }

            if self.buf.len() < MIN_FRAME_LEN {
                break;
            }

            let declared =
                u32::from_be_bytes([self.buf[5], self.buf[6], self.buf[7], self.buf[8]]) as usize;
            if declared > MAX_FRAME_SIZE {
                return Err(ProtocolError::BadLength {
                    declared,
                    available: MAX_FRAME_SIZE,
                });
            }

            let total = MIN_FRAME_LEN + declared;
            if self.buf.len() < total {
                break;
            }

            out.push(Inbound::Frame(self.buf[..total].to_vec()));
            self.buf.drain(..total);
        }

        Ok(out)
    }

    /// Whether partial data is waiting for more bytes.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}
