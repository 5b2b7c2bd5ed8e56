//! Per-connection peer state shared between the transports, the registry,
//! and the router.
//!
//! A `Peer` is created when a socket is accepted and lives until its read
//! pump exits. Its family is fixed by the transport that accepted it; its
//! identity (tenant, user, tag) is learned later from CONNECT frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants::UNKNOWN_TENANT;
use crate::protocol::PeerFamily;

/// Mutable identity fields, learned from CONNECT (or adopted from the first
/// MESSAGE while the tenant is still unknown).
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    /// Tenant partition the peer routes within. Starts as `"unknown"`.
    pub tenant_code: String,
    /// User within the tenant.
    pub user_code: String,
    /// Free-form self-description from the CONNECT `source` field.
    pub device_tag: Option<String>,
}

/// Reasons an enqueue onto a peer's outbound queue can fail. Both are fatal
/// to the peer, never to the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    /// The bounded queue is full (slow consumer).
    #[error("outbound queue full")]
    QueueFull,
    /// The peer is closed or its writer has exited.
    #[error("peer closed")]
    Closed,
}

/// One connected client, desk or device.
#[derive(Debug)]
pub struct Peer {
    /// Process-unique identifier, allocated at accept.
    id: String,
    /// Transport-fixed family: devices arrive over TCP, desks over WebSocket.
    family: PeerFamily,
    /// Remote address, for logs only.
    remote_addr: String,
    /// Identity fields guarded by their own lock; compound transitions are
    /// additionally serialized by the registry's shard bank.
    identity: Mutex<PeerIdentity>,
    /// Bounded outbound queue feeding the writer pump.
    outbound: mpsc::Sender<Vec<u8>>,
    /// Cancelling this token aborts both pumps and closes the socket.
    cancel: CancellationToken,
    /// Cleared when the peer is torn down.
    active: AtomicBool,
    /// Set exactly once by [`Peer::close`].
    closed: AtomicBool,
}

impl Peer {
    /// Create a peer for a freshly accepted socket.
    pub fn new(
        family: PeerFamily,
        remote_addr: String,
        outbound: mpsc::Sender<Vec<u8>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            family,
            remote_addr,
            identity: Mutex::new(PeerIdentity {
                tenant_code: UNKNOWN_TENANT.to_string(),
                user_code: String::new(),
                device_tag: None,
            }),
            outbound,
            cancel,
            active: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    /// Unique peer identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Family fixed at accept time.
    pub fn family(&self) -> PeerFamily {
        self.family
    }

    /// Remote socket address.
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Current tenant code.
    pub fn tenant_code(&self) -> String {
        self.lock_identity().tenant_code.clone()
    }

    /// Snapshot of the identity fields.
    pub fn identity(&self) -> PeerIdentity {
        self.lock_identity().clone()
    }

    /// Whether the peer has learned a concrete tenant yet.
    pub fn has_tenant(&self) -> bool {
        self.lock_identity().tenant_code != UNKNOWN_TENANT
    }

    /// Update user code and device tag from a CONNECT frame. The tenant
    /// transition goes through the registry's reindex path instead.
    pub fn set_user_identity(&self, user_code: &str, device_tag: &str) {
        let mut identity = self.lock_identity();
        identity.user_code = user_code.to_string();
        if !device_tag.is_empty() {
            identity.device_tag = Some(device_tag.to_string());
        }
    }

    /// Set the tenant code. Callers must hold the registry's shard lock for
    /// this peer (the registry's reindex does).
    pub(crate) fn set_tenant_code(&self, tenant_code: &str) {
        self.lock_identity().tenant_code = tenant_code.to_string();
    }

    /// Non-blocking enqueue of pre-encoded frame bytes.
    ///
    /// # Errors
    ///
    /// [`EnqueueError::QueueFull`] on overflow, [`EnqueueError::Closed`] if
    /// the writer is gone. Either way the caller should tear the peer down.
    pub fn try_enqueue(&self, bytes: Vec<u8>) -> Result<(), EnqueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EnqueueError::Closed);
        }
        self.outbound.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Cancellation token for this peer's pumps.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the peer is still live.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Tear the peer down: mark inactive, cancel both pumps.
    ///
    /// Idempotent; returns `true` only for the call that performed the
    /// transition.
    pub fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.active.store(false, Ordering::Release);
        self.cancel.cancel();
        true
    }

    fn lock_identity(&self) -> std::sync::MutexGuard<'_, PeerIdentity> {
        self.identity.lock().expect("peer identity mutex poisoned")
    }
}
