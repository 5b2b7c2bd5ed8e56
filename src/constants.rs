//! Application-wide constants for the seatlink hub.
//!
//! This module centralizes all timing and sizing knobs so they are
//! discoverable in one place. Constants are grouped by domain.
//!
//! # Categories
//!
//! - **Deadlines**: per-socket read/write time limits
//! - **Intervals**: background ticker cadences
//! - **Eviction**: liveness thresholds
//! - **Queues & sizing**: channel capacities and frame limits
//! - **Listeners**: default bind addresses

use std::time::Duration;

// ============================================================================
// Deadlines
// ============================================================================

/// Maximum time to wait for bytes from a peer before the read pump gives up.
///
/// Matches the in-band heartbeat contract: clients ping well inside this
/// window, so a silent socket for this long means the peer is gone.
pub const READ_DEADLINE: Duration = Duration::from_secs(60);

/// Maximum time a single outbound write may take before the peer is
/// considered stalled and its connection torn down.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);

// ============================================================================
// Intervals
// ============================================================================

/// Transport-level WebSocket ping cadence.
pub const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

/// How often the TCP liveness monitor scans for dead device connections.
pub const TCP_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// How often the coordinator sweeps the registry for idle peers.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How often the coordinator logs aggregate connection counts.
pub const STATS_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Eviction
// ============================================================================

/// A TCP device peer silent for longer than this is evicted by the monitor.
pub const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// A registered peer with no activity for longer than this is swept.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Grace period for in-flight writes to drain during shutdown.
pub const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

// ============================================================================
// Queues & sizing
// ============================================================================

/// Per-peer outbound queue depth. Enqueues never block; a full queue is
/// fatal to that peer.
pub const OUTBOUND_QUEUE_SIZE: usize = 256;

/// Upper bound on a single frame's declared payload length (8 KB).
pub const MAX_FRAME_SIZE: usize = 8192;

/// Number of read/write lock shards in the registry's per-peer lock bank.
pub const SHARD_COUNT: usize = 16;

/// Tenant code assigned to peers that have not identified themselves yet.
pub const UNKNOWN_TENANT: &str = "unknown";

// ============================================================================
// Listeners
// ============================================================================

/// Default bind address for the device-facing TCP listener.
pub const DEFAULT_TCP_ADDR: &str = "0.0.0.0:8091";

/// Default bind address for the HTTP listener (`/ws`, `/health`).
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_values_are_reasonable() {
        // Write deadline must be far shorter than the read deadline so a
        // stalled writer is detected before the reader's liveness window
        // expires.
        assert!(WRITE_DEADLINE < READ_DEADLINE);

        // Pings must fit well inside the read deadline.
        assert!(WS_PING_INTERVAL * 2 <= READ_DEADLINE);
    }

    #[test]
    fn test_eviction_ordering() {
        // The transport-level timeout is tighter than the registry sweep.
        assert!(TCP_IDLE_TIMEOUT < IDLE_TIMEOUT);
        assert!(CLEANUP_INTERVAL < IDLE_TIMEOUT);
    }
}
