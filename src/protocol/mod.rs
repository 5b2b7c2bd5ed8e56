//! Binary wire protocol shared by both transports.
//!
//! Every frame on the wire is:
//!
//! ```text
//! [auth: 4 bytes] [type: 1 byte] [len: u32 BE] [data: len bytes]
//! ```
//!
//! The fourth auth byte is a family-specific checksum over the first three,
//! which are freshly random on every encode. The checksum therefore tags the
//! frame with the peer family that produced it while acting as a cheap
//! malformed-frame filter. It is not authentication.
//!
//! Frame types:
//! - `1`: CONNECT — identity handshake (tenant, user, source)
//! - `2`: MESSAGE — seat/power event, fanned out to the opposite family
//! - `3`: PING / `4`: PONG — in-band liveness
//! - `5`: WELCOME — hub greeting
//!
//! Submodules: [`codec`] for the envelope, [`payload`] for the inner field
//! sequences.

pub mod codec;
pub mod payload;

use thiserror::Error;

/// Smallest possible frame: 4 auth + 1 type + 4 length.
pub const MIN_FRAME_LEN: usize = 9;

/// The two peer populations the hub bridges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerFamily {
    /// Desk software, connected over WebSocket.
    Desk,
    /// Embedded seat controller, connected over raw TCP.
    Device,
}

impl PeerFamily {
    /// The family a frame from this family fans out to.
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Desk => Self::Device,
            Self::Device => Self::Desk,
        }
    }

    /// Wire-level name, as carried in CONNECT/MESSAGE `source` fields.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Desk => "desk",
            Self::Device => "device",
        }
    }

    /// Map a `source` string to a family. Unrecognized sources default to
    /// [`PeerFamily::Desk`].
    #[must_use]
    pub fn from_source(source: &str) -> Self {
        match source {
            "device" => Self::Device,
            _ => Self::Desk,
        }
    }
}

impl std::fmt::Display for PeerFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Connect = 1,
    Message = 2,
    Ping = 3,
    Pong = 4,
    Welcome = 5,
}

impl FrameType {
    /// Parse a wire type byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Connect),
            2 => Some(Self::Message),
            3 => Some(Self::Ping),
            4 => Some(Self::Pong),
            5 => Some(Self::Welcome),
            _ => None,
        }
    }

    /// Human-readable name for logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Message => "message",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Welcome => "welcome",
        }
    }
}

/// A decoded frame envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The auth prefix exactly as it appeared on the wire.
    pub auth: [u8; 4],
    /// Frame type.
    pub frame_type: FrameType,
    /// Inner payload bytes (field sequences, see [`payload`]).
    pub data: Vec<u8>,
}

/// Errors produced by the codec layer.
///
/// None of these propagate past the reader pump: the transport logs them
/// and either drops the frame or, for stream-poisoning cases, tears down
/// the peer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Fewer than [`MIN_FRAME_LEN`] bytes.
    #[error("frame too short: {0} bytes")]
    BadFrame(usize),

    /// Neither family checksum matched the auth prefix.
    #[error("auth prefix matches no peer family")]
    BadAuth,

    /// Declared payload length exceeds what is available or allowed.
    #[error("declared length {declared} exceeds {available} available bytes")]
    BadLength { declared: usize, available: usize },

    /// A payload field's declared length overflows the inner buffer.
    #[error("payload field '{0}' overflows buffer")]
    BadPayload(&'static str),

    /// Unknown frame type byte.
    #[error("unknown frame type {0}")]
    UnknownType(u8),
}
