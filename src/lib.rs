//! Seatlink: a dual-transport relay hub.
//!
//! Bridges two client populations within a tenant: DESK clients connected
//! over WebSocket and embedded DEVICE controllers connected over raw TCP.
//! Frames carry a self-describing auth prefix whose checksum identifies
//! the sender family; data frames fan out to every opposite-family peer
//! sharing the sender's tenant code.
//!
//! Layer map, leaves first:
//!
//! - [`protocol`] — wire codec: envelope, payloads, stream reassembly
//! - [`tcp`] / [`ws`] — transport endpoints with per-peer pumps
//! - [`registry`] — tenant-indexed peer directory with sharded locks
//! - [`router`] — opposite-family fan-out
//! - [`hub`] — lifecycle coordinator tying the above together
//!
//! The hub is in-memory and best-effort: no persistence, no
//! store-and-forward, no cross-hub replication.

pub mod config;
pub mod constants;
pub mod hub;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod tcp;
pub mod ws;

pub use config::Config;
pub use hub::{Hub, HubHandle, HubOptions};
pub use peer::Peer;
pub use protocol::{Frame, FrameType, PeerFamily, ProtocolError};
pub use registry::Registry;
pub use tcp::TcpServer;
pub use ws::WsServer;
