//! Tenant-scoped fan-out of MESSAGE frames.
//!
//! The routing decision is stateless: a data frame from one family goes to
//! every opposite-family peer sharing the sender's tenant, re-encoded with
//! a fresh auth prefix valid for each recipient's family. Control frames
//! never fan out, and the sender never receives its own frame.

// Rust guideline compliant 2026-02

use std::collections::HashSet;
use std::sync::Arc;

use crate::peer::{EnqueueError, Peer};
use crate::protocol::codec::{decode, encode};
use crate::protocol::payload::decode_message_data;
use crate::protocol::FrameType;
use crate::registry::Registry;

/// Route one inbound data frame.
///
/// Returns the number of peers the frame was enqueued for. Every failure
/// mode is local: decode errors drop the frame, an overflowing recipient
/// queue tears down that recipient only.
pub fn route(registry: &Registry, sender: &Arc<Peer>, raw: &[u8]) -> usize {
    let (frame, _auth_family) = match decode(raw) {
        Ok(decoded) => decoded,
        Err(e) => {
            log::warn!("router: undecodable frame from {}: {e}", sender.id());
            return 0;
        }
    };

    if frame.frame_type != FrameType::Message {
        log::debug!(
            "router: ignoring {} frame from {}",
            frame.frame_type.name(),
            sender.id()
        );
        return 0;
    }

    let payload = match decode_message_data(&frame.data) {
        Ok(payload) => payload,
        Err(e) => {
            log::warn!("router: bad message payload from {}: {e}", sender.id());
            return 0;
        }
    };

    let target_family = sender.family().opposite();
    let tenant = sender.tenant_code();
    let snapshot = registry.peers_for_tenant(&tenant);

    if snapshot.is_empty() {
        log::debug!("router: no peers in tenant {tenant}");
        return 0;
    }

    let mut sent: HashSet<String> = HashSet::new();
    let mut recipients = 0usize;

    for recipient in &snapshot {
        if recipient.family() != target_family {
            continue;
        }
        if sent.contains(recipient.id()) {
            continue;
        }

        // Fresh, family-correct auth prefix per recipient; payload bytes
        // pass through untouched.
        let encoded = encode(frame.frame_type, &frame.data, recipient.family());
        match recipient.try_enqueue(encoded) {
            Ok(()) => {
                recipients += 1;
                sent.insert(recipient.id().to_string());
            }
            Err(EnqueueError::QueueFull) => {
                log::warn!(
                    "router: queue full for {}, dropping peer",
                    recipient.id()
                );
                recipient.close();
            }
            Err(EnqueueError::Closed) => {
                log::debug!("router: skipping closed peer {}", recipient.id());
            }
        }
    }

    if recipients > 0 {
        log::info!(
            "routed message tenant={} user={} source={} room={} seat={} power={} recipients={}",
            payload.tenant_code,
            payload.user_code,
            payload.source,
            payload.room_code,
            payload.seat_number,
            payload.power_number,
            recipients
        );
    } else {
        log::debug!(
            "no recipients for message tenant={} user={}",
            payload.tenant_code,
            payload.user_code
        );
    }

    recipients
}
