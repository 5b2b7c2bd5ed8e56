//! TCP listener for DEVICE peers.
//!
//! Accepts raw TCP connections, wraps each in a [`Peer`] with a bounded
//! outbound queue, and runs one reader and one writer task per connection.
//! Devices have no transport-level ping, so liveness rests on the 60 s read
//! deadline, the in-band PING frames, and a 30 s monitor that evicts
//! devices silent for longer than the idle threshold.

// Rust guideline compliant 2026-02

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::constants::{
    OUTBOUND_QUEUE_SIZE, READ_DEADLINE, TCP_IDLE_TIMEOUT, TCP_MONITOR_INTERVAL, WRITE_DEADLINE,
};
use crate::hub::HubHandle;
use crate::peer::Peer;
use crate::protocol::codec::{FrameAssembler, Inbound, LEGACY_PONG};
use crate::protocol::PeerFamily;

/// Device-facing TCP server.
#[derive(Debug)]
pub struct TcpServer {
    local_addr: SocketAddr,
    accept_handle: JoinHandle<()>,
    monitor_handle: JoinHandle<()>,
}

impl TcpServer {
    /// Bind the listener and spawn the accept loop and liveness monitor.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound; this is fatal to
    /// the process.
    pub async fn start(addr: &str, hub: HubHandle) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind TCP listener on {addr}"))?;
        let local_addr = listener.local_addr()?;
        log::info!("TCP server listening on {local_addr}");

        let accept_handle = tokio::spawn(accept_loop(listener, hub.clone()));
        let monitor_handle = tokio::spawn(monitor_loop(hub));

        Ok(Self {
            local_addr,
            accept_handle,
            monitor_handle,
        })
    }

    /// Bound address (useful when started on port 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the accept loop and monitor. Existing connections are torn
    /// down through the hub's connection token, not here.
    pub fn shutdown(self) {
        self.accept_handle.abort();
        self.monitor_handle.abort();
    }
}

async fn accept_loop(listener: TcpListener, hub: HubHandle) {
    let token = hub.conn_token().clone();
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("TCP accept loop stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let hub = hub.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, addr, hub).await;
                    });
                }
                Err(e) => {
                    log::error!("TCP accept error: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Evict device peers that have been silent past the idle threshold.
async fn monitor_loop(hub: HubHandle) {
    let token = hub.conn_token().clone();
    let mut ticker = tokio::time::interval(TCP_MONITOR_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                for peer in hub
                    .registry()
                    .idle_peers(TCP_IDLE_TIMEOUT, Some(PeerFamily::Device))
                {
                    log::info!("evicting silent device peer {}", peer.id());
                    // Closing cancels the pumps; the reader runs the
                    // normal cleanup path on its way out.
                    peer.close();
                }
            }
        }
    }
}

/// Lifecycle of one accepted device connection.
async fn handle_connection(stream: TcpStream, addr: SocketAddr, hub: HubHandle) {
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("set_nodelay failed for {addr}: {e}");
    }

    let cancel = hub.conn_token().child_token();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
    let peer = Arc::new(Peer::new(
        PeerFamily::Device,
        addr.to_string(),
        outbound_tx,
        cancel,
    ));
    log::info!("TCP device connected: {} from {addr}", peer.id());

    hub.register(peer.clone()).await;

    let (read_half, write_half) = stream.into_split();
    let writer = tokio::spawn(write_loop(peer.clone(), write_half, outbound_rx));

    read_loop(&peer, read_half, &hub).await;

    // Single cleanup path: reader exit tears everything down.
    peer.close();
    hub.retire(peer.clone()).await;
    let _ = writer.await;
    log::info!("TCP device disconnected: {}", peer.id());
}

/// Reader pump: reassemble frames from the byte stream and dispatch them.
async fn read_loop(peer: &Arc<Peer>, mut reader: OwnedReadHalf, hub: &HubHandle) {
    let cancel = peer.cancel_token();
    let mut assembler = FrameAssembler::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return,
            read = tokio::time::timeout(READ_DEADLINE, reader.read(&mut buf)) => match read {
                Err(_) => {
                    log::info!("read deadline expired for {}", peer.id());
                    return;
                }
                Ok(Ok(0)) => return, // EOF
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    log::warn!("read error for {}: {e}", peer.id());
                    return;
                }
            }
        };

        let items = match assembler.feed(&buf[..n]) {
            Ok(items) => items,
            Err(e) => {
                log::warn!("unrecoverable stream from {}: {e}", peer.id());
                return;
            }
        };

        for item in items {
            match item {
                Inbound::LegacyPing => {
                    log::debug!("legacy ping from {}", peer.id());
                    hub.registry().touch(peer.id());
                    if peer.try_enqueue(LEGACY_PONG.to_vec()).is_err() {
                        return;
                    }
                }
                Inbound::Frame(frame) => {
                    if let Err(e) = hub.handle_frame(peer, &frame) {
                        // Raw TCP mode drops malformed frames quietly; the
                        // peer stays connected.
                        log::debug!("dropping bad frame from {}: {e}", peer.id());
                    }
                }
            }
        }
    }
}

/// Writer pump: drain the bounded queue onto the socket under the write
/// deadline.
async fn write_loop(
    peer: Arc<Peer>,
    mut writer: OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
) {
    let cancel = peer.cancel_token();

    loop {
        let bytes = tokio::select! {
            _ = cancel.cancelled() => break,
            queued = outbound_rx.recv() => match queued {
                Some(bytes) => bytes,
                None => break,
            }
        };

        match tokio::time::timeout(WRITE_DEADLINE, writer.write_all(&bytes)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::warn!("write error for {}: {e}", peer.id());
                peer.close();
                break;
            }
            Err(_) => {
                log::warn!("write deadline expired for {}", peer.id());
                peer.close();
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
}
