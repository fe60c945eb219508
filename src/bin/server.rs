//! roomdrop signaling server.
//!
//! Stateless relay between the two peers of a room: WebSocket signaling
//! on `/ws`, client runtime configuration on `/config`, liveness on
//! `/healthz`. No payload byte ever passes through this process.

use clap::Parser;
use roomdrop::server::config::ServerConfig;
use roomdrop::server::ws::{build_router, spawn_sweeper, AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// roomdrop signaling server.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Listen port; overrides ROOMDROP_PORT.
    #[clap(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::from_env();
    if let Some(port) = args.port {
        config.port = port;
    }

    let addr = format!("0.0.0.0:{}", config.port);
    info!(
        event = "server_starting",
        %addr,
        room_ttl_ms = config.room_ttl.as_millis() as u64,
        max_signal_payload = config.max_signal_payload,
    );

    let state = AppState::new(config);
    spawn_sweeper(state.clone());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    println!("roomdrop signaling server listening on {addr}");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}
