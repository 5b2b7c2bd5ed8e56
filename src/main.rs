//! Seatlink relay hub binary.
//!
//! Starts the TCP (device) and HTTP/WebSocket (desk) listeners, runs until
//! SIGINT or SIGTERM, then drains and exits. Listener bind failures are
//! the only errors that reach the process boundary.

use anyhow::Result;
use clap::Parser;

use seatlink::config::normalize_addr;
use seatlink::{Config, Hub, TcpServer, WsServer};

/// Relay hub bridging desk clients and embedded seat controllers.
#[derive(Parser, Debug)]
#[command(name = "seatlink", version, about)]
struct Cli {
    /// Device-facing TCP listen address (overrides TCP_SERVER_ADDRESS).
    #[arg(long)]
    tcp_addr: Option<String>,

    /// Desk-facing HTTP listen address (/ws, /health).
    #[arg(long)]
    http_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(addr) = cli.tcp_addr {
        config.tcp_addr = normalize_addr(&addr);
    }
    if let Some(addr) = cli.http_addr {
        config.http_addr = normalize_addr(&addr);
    }

    let hub = Hub::new();
    let tcp_server = TcpServer::start(&config.tcp_addr, hub.handle()).await?;
    let ws_server = WsServer::start(&config.http_addr, hub.handle()).await?;

    log::info!(
        "seatlink ready: devices on {}, desks on {}",
        tcp_server.local_addr(),
        ws_server.local_addr()
    );

    wait_for_signal().await;
    log::info!("signal received, shutting down");

    tcp_server.shutdown();
    ws_server.shutdown();
    hub.shutdown().await;

    log::info!("bye");
    Ok(())
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt =
            signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
