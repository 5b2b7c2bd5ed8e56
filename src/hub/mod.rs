//! Hub wiring and lifecycle coordination.
//!
//! The [`Hub`] owns the registry, the registration/unregistration channels,
//! and the callback set. A single coordinator task multiplexes peer
//! admission, peer removal, the idle-peer sweep, and stats logging with
//! `tokio::select!`. Transports talk to the hub through a cloneable
//! [`HubHandle`].
//!
//! Callback contract: connect and disconnect callbacks run on the
//! coordinator task; message handlers run on the reader task of the peer
//! that produced the frame. None of them may block or re-enter the
//! registry's compound operations.

// Rust guideline compliant 2026-02

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::{CLEANUP_INTERVAL, IDLE_TIMEOUT, STATS_INTERVAL};
use crate::peer::Peer;
use crate::protocol::codec::decode;
use crate::protocol::payload::{decode_connect_data, decode_message_data, pong_frame, welcome_frame};
use crate::protocol::{FrameType, ProtocolError};
use crate::registry::Registry;
use crate::router;

/// Text carried by WELCOME frames. The payload codec round-trips it; desks
/// display it nowhere, so it stays empty like the original wire traffic.
const WELCOME_TEXT: &str = "";

/// Invoked on the coordinator task when a peer is admitted.
pub type ConnectCallback = Box<dyn Fn(&Arc<Peer>) + Send + Sync>;

/// Invoked on the coordinator task, exactly once, when a peer is removed.
pub type DisconnectCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Runs on the reader task for every inbound MESSAGE frame, before the
/// router. Returning `true` consumes the frame.
pub type MessageHandler = Box<dyn Fn(&Arc<Peer>, &[u8]) -> bool + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_connect: RwLock<Option<ConnectCallback>>,
    on_disconnect: RwLock<Option<DisconnectCallback>>,
    message_handlers: RwLock<Vec<MessageHandler>>,
}

impl Callbacks {
    fn peer_connected(&self, peer: &Arc<Peer>) {
        if let Some(cb) = self
            .on_connect
            .read()
            .expect("callback lock poisoned")
            .as_ref()
        {
            cb(peer);
        }
    }

    fn peer_disconnected(&self, peer_id: &str) {
        if let Some(cb) = self
            .on_disconnect
            .read()
            .expect("callback lock poisoned")
            .as_ref()
        {
            cb(peer_id);
        }
    }

    fn consume_message(&self, peer: &Arc<Peer>, raw: &[u8]) -> bool {
        self.message_handlers
            .read()
            .expect("callback lock poisoned")
            .iter()
            .any(|handler| handler(peer, raw))
    }
}

/// Tuning knobs, overridable in tests. Production code uses the defaults
/// from [`crate::constants`].
#[derive(Debug, Clone, Copy)]
pub struct HubOptions {
    /// Sweep threshold: peers idle longer than this are evicted.
    pub idle_timeout: Duration,
    /// Sweep cadence.
    pub cleanup_interval: Duration,
    /// Stats logging cadence.
    pub stats_interval: Duration,
    /// Grace period for in-flight cleanups during shutdown.
    pub drain_timeout: Duration,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            idle_timeout: IDLE_TIMEOUT,
            cleanup_interval: CLEANUP_INTERVAL,
            stats_interval: STATS_INTERVAL,
            drain_timeout: crate::constants::SHUTDOWN_DRAIN,
        }
    }
}

/// Cloneable handle the transports use to talk to the hub.
#[derive(Clone)]
pub struct HubHandle {
    registry: Arc<Registry>,
    callbacks: Arc<Callbacks>,
    reg_tx: mpsc::Sender<Arc<Peer>>,
    unreg_tx: mpsc::Sender<Arc<Peer>>,
    conn_token: CancellationToken,
}

impl std::fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubHandle")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl HubHandle {
    /// Shared peer directory.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Token that is cancelled when the hub stops accepting connections.
    /// Per-peer tokens should be children of this one.
    pub fn conn_token(&self) -> &CancellationToken {
        &self.conn_token
    }

    /// Admit a freshly accepted peer through the registration channel.
    ///
    /// The channel is capacity-1, serializing admission on the coordinator.
    /// If the coordinator is already gone (shutdown race) the peer is
    /// registered inline so the cleanup path still finds it.
    pub async fn register(&self, peer: Arc<Peer>) {
        if let Err(send_err) = self.reg_tx.send(peer).await {
            let peer = send_err.0;
            self.registry.register(peer.clone());
            self.callbacks.peer_connected(&peer);
        }
    }

    /// Retire a peer through the unregistration channel.
    ///
    /// Safe to call multiple times; the registry's removal gate keeps the
    /// disconnect callback to exactly one invocation.
    pub async fn retire(&self, peer: Arc<Peer>) {
        if let Err(send_err) = self.unreg_tx.send(peer).await {
            remove_peer(&self.registry, &self.callbacks, &send_err.0);
        }
    }

    /// Process one complete inbound frame from a peer.
    ///
    /// Touches last-activity, answers control frames, applies identity
    /// transitions, and hands data frames to the router.
    ///
    /// # Errors
    ///
    /// Returns the codec error for an undecodable frame; the transport
    /// decides whether that drops the frame or the peer.
    pub fn handle_frame(&self, peer: &Arc<Peer>, raw: &[u8]) -> Result<(), ProtocolError> {
        self.registry.touch(peer.id());

        let (frame, _auth_family) = decode(raw)?;
        log::debug!(
            "{} frame from {} ({})",
            frame.frame_type.name(),
            peer.id(),
            peer.family()
        );

        match frame.frame_type {
            FrameType::Ping => {
                if peer.try_enqueue(pong_frame(peer.family())).is_err() {
                    peer.close();
                }
            }
            FrameType::Pong => {
                // Liveness already recorded by the touch above.
            }
            FrameType::Connect => {
                let connect = decode_connect_data(&frame.data)?;
                peer.set_user_identity(&connect.user_code, &connect.source);
                if !connect.tenant_code.is_empty() {
                    self.registry.reindex(peer, &connect.tenant_code);
                }
                log::info!(
                    "peer {} identified: tenant={} user={} source={}",
                    peer.id(),
                    connect.tenant_code,
                    connect.user_code,
                    connect.source
                );
                if peer.try_enqueue(welcome_frame(WELCOME_TEXT, peer.family())).is_err() {
                    peer.close();
                }
            }
            FrameType::Message => {
                // A peer that never sent CONNECT adopts the tenant embedded
                // in its first data frame.
                if !peer.has_tenant() {
                    if let Ok(payload) = decode_message_data(&frame.data) {
                        if !payload.tenant_code.is_empty() {
                            self.registry.reindex(peer, &payload.tenant_code);
                        }
                    }
                }
                if !self.callbacks.consume_message(peer, raw) {
                    router::route(&self.registry, peer, raw);
                }
            }
            FrameType::Welcome => {
                log::debug!("ignoring inbound welcome from {}", peer.id());
            }
        }

        Ok(())
    }
}

/// Remove a peer from the registry and fire the disconnect callback once.
fn remove_peer(registry: &Registry, callbacks: &Callbacks, peer: &Arc<Peer>) {
    if registry.unregister(peer) {
        peer.close();
        let identity = peer.identity();
        log::info!(
            "peer unregistered: {} tenant={} ({})",
            peer.id(),
            identity.tenant_code,
            peer.family()
        );
        callbacks.peer_disconnected(peer.id());
    }
}

/// The hub: registry, coordinator task, and shutdown orchestration.
pub struct Hub {
    handle: HubHandle,
    options: HubOptions,
    shutdown: CancellationToken,
    coordinator: JoinHandle<()>,
}

impl Hub {
    /// Build a hub with default options and spawn its coordinator.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(HubOptions::default())
    }

    /// Build a hub with explicit tuning knobs.
    #[must_use]
    pub fn with_options(options: HubOptions) -> Self {
        let shutdown = CancellationToken::new();
        // Register/unregister are capacity-1: admission is serialized
        // through the coordinator like an unbuffered channel.
        let (reg_tx, reg_rx) = mpsc::channel(1);
        let (unreg_tx, unreg_rx) = mpsc::channel(1);

        let handle = HubHandle {
            registry: Arc::new(Registry::new()),
            callbacks: Arc::new(Callbacks::default()),
            reg_tx,
            unreg_tx,
            conn_token: shutdown.child_token(),
        };

        let coordinator = tokio::spawn(coordinator_loop(
            handle.clone(),
            reg_rx,
            unreg_rx,
            options,
            shutdown.clone(),
        ));

        Self {
            handle,
            options,
            shutdown,
            coordinator,
        }
    }

    /// Handle for transports and tests.
    #[must_use]
    pub fn handle(&self) -> HubHandle {
        self.handle.clone()
    }

    /// Shared peer directory.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.handle.registry
    }

    /// Install the connect callback.
    pub fn set_on_peer_connected(&self, callback: ConnectCallback) {
        *self
            .handle
            .callbacks
            .on_connect
            .write()
            .expect("callback lock poisoned") = Some(callback);
    }

    /// Install the disconnect callback.
    pub fn set_on_peer_disconnected(&self, callback: DisconnectCallback) {
        *self
            .handle
            .callbacks
            .on_disconnect
            .write()
            .expect("callback lock poisoned") = Some(callback);
    }

    /// Add a message handler that runs before the router and may consume
    /// the frame.
    pub fn add_message_handler(&self, handler: MessageHandler) {
        self.handle
            .callbacks
            .message_handlers
            .write()
            .expect("callback lock poisoned")
            .push(handler);
    }

    /// Graceful shutdown: stop accepting, close every peer, allow a drain
    /// window for cleanups, then stop the coordinator.
    pub async fn shutdown(self) {
        log::info!("hub shutting down");
        self.handle.conn_token.cancel();

        for peer in self.handle.registry.all_peers() {
            peer.close();
        }

        let deadline = tokio::time::Instant::now() + self.options.drain_timeout;
        while !self.handle.registry.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Anything still registered after the drain window is removed
        // directly so disconnect callbacks are not lost.
        for peer in self.handle.registry.all_peers() {
            remove_peer(&self.handle.registry, &self.handle.callbacks, &peer);
        }

        self.shutdown.cancel();
        let _ = self.coordinator.await;
        log::info!("hub stopped");
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// Coordinator main loop: admission, removal, sweep, stats.
async fn coordinator_loop(
    handle: HubHandle,
    mut reg_rx: mpsc::Receiver<Arc<Peer>>,
    mut unreg_rx: mpsc::Receiver<Arc<Peer>>,
    options: HubOptions,
    shutdown: CancellationToken,
) {
    let mut cleanup = tokio::time::interval(options.cleanup_interval);
    let mut stats = tokio::time::interval(options.stats_interval);
    cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    stats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // Both tickers fire immediately once; swallow that.
    cleanup.tick().await;
    stats.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            Some(peer) = reg_rx.recv() => {
                if !peer.is_active() {
                    // The connection died before admission completed.
                    log::debug!("skipping registration of closed peer {}", peer.id());
                    continue;
                }
                let identity = peer.identity();
                log::info!(
                    "peer registered: {} tenant={} ({}) from {}",
                    peer.id(),
                    identity.tenant_code,
                    peer.family(),
                    peer.remote_addr()
                );
                handle.registry.register(peer.clone());
                handle.callbacks.peer_connected(&peer);
            }

            Some(peer) = unreg_rx.recv() => {
                remove_peer(&handle.registry, &handle.callbacks, &peer);
            }

            _ = cleanup.tick() => {
                let idle = handle.registry.idle_peers(options.idle_timeout, None);
                if idle.is_empty() {
                    continue;
                }
                log::info!("sweeping {} idle peer(s)", idle.len());
                // Forward through the unregistration channel from a helper
                // task: the coordinator must not block on its own bounded
                // channel.
                let hub = handle.clone();
                tokio::spawn(async move {
                    for peer in idle {
                        peer.close();
                        hub.retire(peer).await;
                    }
                });
            }

            _ = stats.tick() => {
                let counts = handle.registry.counts();
                log::info!(
                    "connections: total={} desk={} device={}",
                    counts.total,
                    counts.desk,
                    counts.device
                );
            }
        }
    }

    log::debug!("coordinator exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{OUTBOUND_QUEUE_SIZE, UNKNOWN_TENANT};
    use crate::protocol::payload::{connect_frame, message_frame, ping_frame};
    use crate::protocol::PeerFamily;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spawn_peer(hub: &Hub, family: PeerFamily) -> (Arc<Peer>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let peer = Arc::new(Peer::new(
            family,
            "127.0.0.1:0".to_string(),
            tx,
            hub.handle().conn_token().child_token(),
        ));
        (peer, rx)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_register_fires_connect_callback() {
        let hub = Hub::new();
        let connects = Arc::new(AtomicUsize::new(0));
        let seen = connects.clone();
        hub.set_on_peer_connected(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let (peer, _rx) = spawn_peer(&hub, PeerFamily::Device);
        hub.handle().register(peer.clone()).await;

        let registry = hub.registry().clone();
        let id = peer.id().to_string();
        wait_until(move || registry.contains(&id)).await;
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retire_fires_disconnect_exactly_once() {
        let hub = Hub::new();
        let disconnects = Arc::new(AtomicUsize::new(0));
        let seen = disconnects.clone();
        hub.set_on_peer_disconnected(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let (peer, _rx) = spawn_peer(&hub, PeerFamily::Desk);
        hub.handle().register(peer.clone()).await;
        let registry = hub.registry().clone();
        let id = peer.id().to_string();
        wait_until(move || registry.contains(&id)).await;

        hub.handle().retire(peer.clone()).await;
        hub.handle().retire(peer.clone()).await;

        let registry = hub.registry().clone();
        wait_until(move || registry.is_empty()).await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(!peer.is_active());
    }

    #[tokio::test]
    async fn test_connect_frame_identifies_and_welcomes() {
        let hub = Hub::new();
        let (peer, mut rx) = spawn_peer(&hub, PeerFamily::Desk);
        hub.handle().register(peer.clone()).await;
        let registry = hub.registry().clone();
        let id = peer.id().to_string();
        wait_until(move || registry.contains(&id)).await;

        let raw = connect_frame("ACME", "u7", "desk");
        hub.handle().handle_frame(&peer, &raw).unwrap();

        assert_eq!(peer.tenant_code(), "ACME");
        assert_eq!(peer.identity().user_code, "u7");
        assert!(hub.registry().tenant_contains("ACME", peer.id()));
        assert!(!hub.registry().tenant_contains(UNKNOWN_TENANT, peer.id()));

        let bytes = rx.try_recv().unwrap();
        let (frame, family) = decode(&bytes).unwrap();
        assert_eq!(frame.frame_type, FrameType::Welcome);
        assert_eq!(family, PeerFamily::Desk);
    }

    #[tokio::test]
    async fn test_ping_answered_with_family_pong() {
        let hub = Hub::new();
        let (peer, mut rx) = spawn_peer(&hub, PeerFamily::Device);
        hub.handle().register(peer.clone()).await;

        hub.handle()
            .handle_frame(&peer, &ping_frame(PeerFamily::Device))
            .unwrap();

        let bytes = rx.try_recv().unwrap();
        let (frame, family) = decode(&bytes).unwrap();
        assert_eq!(frame.frame_type, FrameType::Pong);
        assert_eq!(family, PeerFamily::Device);
        // Only the pong, nothing else.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_message_adopts_tenant_and_routes() {
        let hub = Hub::new();
        let (device, _device_rx) = spawn_peer(&hub, PeerFamily::Device);
        let (desk, mut desk_rx) = spawn_peer(&hub, PeerFamily::Desk);
        hub.handle().register(device.clone()).await;
        hub.handle().register(desk.clone()).await;
        let registry = hub.registry().clone();
        wait_until(move || registry.len() == 2).await;

        // Desk is already identified in ACME.
        hub.handle()
            .handle_frame(&desk, &connect_frame("ACME", "u1", "desk"))
            .unwrap();
        let _ = desk_rx.try_recv(); // welcome

        // Device never sent CONNECT; its first MESSAGE carries the tenant.
        let raw = message_frame("ACME", "u2", "device", "r1", "s4", "p2", "t0");
        hub.handle().handle_frame(&device, &raw).unwrap();

        assert_eq!(device.tenant_code(), "ACME");
        assert!(hub.registry().tenant_contains("ACME", device.id()));

        let bytes = desk_rx.try_recv().unwrap();
        let (frame, family) = decode(&bytes).unwrap();
        assert_eq!(frame.frame_type, FrameType::Message);
        assert_eq!(family, PeerFamily::Desk);
    }

    #[tokio::test]
    async fn test_message_handler_consumes_before_router() {
        let hub = Hub::new();
        let handled = Arc::new(AtomicUsize::new(0));
        let seen = handled.clone();
        hub.add_message_handler(Box::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            true
        }));

        let (desk, _desk_rx) = spawn_peer(&hub, PeerFamily::Desk);
        let (device, mut device_rx) = spawn_peer(&hub, PeerFamily::Device);
        hub.handle().register(desk.clone()).await;
        hub.handle().register(device.clone()).await;
        let registry = hub.registry().clone();
        wait_until(move || registry.len() == 2).await;
        hub.handle()
            .handle_frame(&desk, &connect_frame("ACME", "u1", "desk"))
            .unwrap();
        hub.handle()
            .handle_frame(&device, &connect_frame("ACME", "u2", "device"))
            .unwrap();
        let _ = device_rx.try_recv(); // welcome

        let raw = message_frame("ACME", "u1", "desk", "r", "s", "p", "t");
        hub.handle().handle_frame(&desk, &raw).unwrap();

        assert_eq!(handled.load(Ordering::SeqCst), 1);
        // Consumed: the device never saw it.
        assert!(device_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bad_frame_surfaces_error_without_state_change() {
        let hub = Hub::new();
        let (peer, mut rx) = spawn_peer(&hub, PeerFamily::Desk);
        hub.handle().register(peer.clone()).await;
        let registry = hub.registry().clone();
        let id = peer.id().to_string();
        wait_until(move || registry.contains(&id)).await;

        assert!(hub.handle().handle_frame(&peer, b"tiny").is_err());
        assert!(hub.handle().handle_frame(&peer, &[7u8; 32]).is_err());

        // Peer unaffected: still registered, still unknown tenant, no
        // outbound traffic.
        assert!(hub.registry().contains(peer.id()));
        assert_eq!(peer.tenant_code(), UNKNOWN_TENANT);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_peer_once() {
        let hub = Hub::with_options(HubOptions {
            idle_timeout: Duration::from_millis(50),
            cleanup_interval: Duration::from_millis(25),
            stats_interval: Duration::from_secs(3600),
            ..HubOptions::default()
        });
        let disconnects = Arc::new(AtomicUsize::new(0));
        let seen = disconnects.clone();
        hub.set_on_peer_disconnected(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let (peer, _rx) = spawn_peer(&hub, PeerFamily::Device);
        hub.handle().register(peer.clone()).await;
        let registry = hub.registry().clone();
        let id = peer.id().to_string();
        wait_until(move || registry.contains(&id)).await;

        // No activity: the sweep must remove the peer from every index.
        let registry = hub.registry().clone();
        wait_until(move || registry.is_empty()).await;
        assert!(!hub.registry().tenant_contains(UNKNOWN_TENANT, peer.id()));

        // Give a later sweep a chance to double-fire, then check it didn't.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_clears_registry() {
        let hub = Hub::with_options(HubOptions {
            drain_timeout: Duration::from_millis(100),
            ..HubOptions::default()
        });
        let (peer, _rx) = spawn_peer(&hub, PeerFamily::Desk);
        hub.handle().register(peer.clone()).await;
        let registry = hub.registry().clone();
        let id = peer.id().to_string();
        wait_until(move || registry.contains(&id)).await;

        let registry = hub.registry().clone();
        hub.shutdown().await;
        assert!(registry.is_empty());
        assert!(!peer.is_active());
    }
}
