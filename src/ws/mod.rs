//! HTTP listener for DESK peers: `/ws` upgrade and `/health`.
//!
//! Each upgraded WebSocket becomes a [`Peer`] with the same pump structure
//! as the TCP side: a reader translating binary messages into frames and a
//! writer draining the bounded outbound queue, coalescing bursts and
//! sending a transport-level ping every 30 s. Upgrades are accepted from
//! any Origin.

// Rust guideline compliant 2026-02

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::constants::{OUTBOUND_QUEUE_SIZE, READ_DEADLINE, WRITE_DEADLINE, WS_PING_INTERVAL};
use crate::hub::HubHandle;
use crate::peer::Peer;
use crate::protocol::payload::welcome_frame;
use crate::protocol::{PeerFamily, ProtocolError};

/// Desk-facing HTTP/WebSocket server.
#[derive(Debug)]
pub struct WsServer {
    local_addr: SocketAddr,
    serve_handle: JoinHandle<()>,
}

#[derive(Clone)]
struct AppState {
    hub: HubHandle,
}

impl WsServer {
    /// Bind the HTTP listener and start serving `/ws` and `/health`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound; this is fatal to
    /// the process.
    pub async fn start(addr: &str, hub: HubHandle) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;
        let local_addr = listener.local_addr()?;
        log::info!("HTTP server listening on {local_addr} (/ws, /health)");

        let app = Router::new()
            .route("/health", get(health))
            .route("/ws", get(ws_handler))
            .with_state(AppState { hub: hub.clone() });

        let token = hub.conn_token().clone();
        let serve_handle = tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
            if let Err(e) = served {
                log::error!("HTTP server error: {e}");
            }
        });

        Ok(Self {
            local_addr,
            serve_handle,
        })
    }

    /// Bound address (useful when started on port 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Abort the serve task. Existing peers are torn down through the
    /// hub's connection token.
    pub fn shutdown(self) {
        self.serve_handle.abort();
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state.hub))
}

/// Lifecycle of one upgraded desk connection.
async fn handle_socket(socket: WebSocket, addr: SocketAddr, hub: HubHandle) {
    let cancel = hub.conn_token().child_token();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
    let peer = Arc::new(Peer::new(
        PeerFamily::Desk,
        addr.to_string(),
        outbound_tx,
        cancel,
    ));
    log::info!("WebSocket desk connected: {} from {addr}", peer.id());

    hub.register(peer.clone()).await;

    // Greet immediately; a second welcome follows each CONNECT.
    if peer.try_enqueue(welcome_frame("", PeerFamily::Desk)).is_err() {
        log::warn!("could not queue welcome for {}", peer.id());
    }

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(peer.clone(), sink, outbound_rx));

    read_loop(&peer, stream, &hub).await;

    peer.close();
    hub.retire(peer.clone()).await;
    let _ = writer.await;
    log::info!("WebSocket desk disconnected: {}", peer.id());
}

/// Reader pump: one inbound binary message is one frame.
async fn read_loop(peer: &Arc<Peer>, mut stream: SplitStream<WebSocket>, hub: &HubHandle) {
    let cancel = peer.cancel_token();

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return,
            next = tokio::time::timeout(READ_DEADLINE, stream.next()) => match next {
                Err(_) => {
                    log::info!("read deadline expired for {}", peer.id());
                    return;
                }
                Ok(None) => return, // stream finished
                Ok(Some(Err(e))) => {
                    log::warn!("websocket read error for {}: {e}", peer.id());
                    return;
                }
                Ok(Some(Ok(message))) => message,
            }
        };

        match message {
            Message::Binary(data) => match hub.handle_frame(peer, &data) {
                Ok(()) => {}
                Err(e @ ProtocolError::BadFrame(_)) => {
                    // A desk that cannot even produce a 9-byte header is
                    // broken; drop the connection.
                    log::warn!("closing {} on malformed frame: {e}", peer.id());
                    return;
                }
                Err(e) => {
                    log::warn!("dropping bad frame from {}: {e}", peer.id());
                }
            },
            Message::Ping(_) | Message::Pong(_) => {
                hub.registry().touch(peer.id());
            }
            Message::Text(_) => {
                log::debug!("ignoring text message from {} (binary-only)", peer.id());
            }
            Message::Close(_) => return,
        }
    }
}

/// Writer pump: drain the bounded queue, coalescing queued bursts, and
/// keep the transport alive with periodic pings.
async fn write_loop(
    peer: Arc<Peer>,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
) {
    let cancel = peer.cancel_token();
    let mut ping = tokio::time::interval(WS_PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping.tick().await; // swallow the immediate first tick

    'pump: loop {
        tokio::select! {
            _ = cancel.cancelled() => break 'pump,

            queued = outbound_rx.recv() => {
                let Some(first) = queued else { break 'pump };
                if !send_binary(&peer, &mut sink, first).await {
                    break 'pump;
                }
                // Coalesce whatever else is already queued.
                while let Ok(more) = outbound_rx.try_recv() {
                    if !send_binary(&peer, &mut sink, more).await {
                        break 'pump;
                    }
                }
            }

            _ = ping.tick() => {
                let sent = tokio::time::timeout(
                    WRITE_DEADLINE,
                    sink.send(Message::Ping(Vec::new())),
                )
                .await;
                if !matches!(sent, Ok(Ok(()))) {
                    log::debug!("transport ping failed for {}", peer.id());
                    peer.close();
                    break 'pump;
                }
            }
        }
    }

    let _ = sink.close().await;
}

/// Send one binary message under the write deadline. Returns `false` and
/// closes the peer on failure.
async fn send_binary(
    peer: &Arc<Peer>,
    sink: &mut SplitSink<WebSocket, Message>,
    bytes: Vec<u8>,
) -> bool {
    match tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Binary(bytes))).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            log::warn!("write error for {}: {e}", peer.id());
            peer.close();
            false
        }
        Err(_) => {
            log::warn!("write deadline expired for {}", peer.id());
            peer.close();
            false
        }
    }
}
