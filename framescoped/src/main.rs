//! framescoped - relay daemon for frame telemetry
//!
//! Accepts WebSocket connections and forwards whatever a producer (the
//! capture device) sends to every connected viewer. With `--simulate` it
//! also runs a built-in producer that emits plausible random telemetry,
//! which is handy for working on the viewer without a device attached.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod mock;
mod prng;
mod relay;

use relay::Relay;

// ═══════════════════════════════════════════════════════════════════════════
// Command line
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Parser)]
#[command(name = "framescoped", version, about = "Frame telemetry relay daemon")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Run a built-in producer with random telemetry.
    #[arg(long)]
    simulate: bool,

    /// Milliseconds between simulated frames.
    #[arg(long, default_value_t = 33, value_parser = clap::value_parser!(u64).range(1..))]
    frame_interval_ms: u64,

    /// Seed for the simulated stream.
    #[arg(long, default_value_t = 0x5EED)]
    seed: u64,

    /// Messages buffered per viewer before it starts dropping.
    #[arg(long, default_value_t = 256)]
    channel_capacity: usize,
}

// ═══════════════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let relay = Arc::new(Relay::new(args.channel_capacity));
    let shutdown = CancellationToken::new();

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C: shutting down");
                shutdown.cancel();
            }
        });
    }

    if args.simulate {
        tokio::spawn(mock::run(
            Arc::clone(&relay),
            Duration::from_millis(args.frame_interval_ms),
            args.seed,
            shutdown.clone(),
        ));
    }

    let listener = TcpListener::bind(args.bind).await?;
    info!("framescoped listening on ws://{}/ws", args.bind);

    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        info!("Client connected: {}", addr);

        let relay = Arc::clone(&relay);
        tokio::spawn(async move {
            if let Err(e) = relay::handle_client(stream, addr, relay).await {
                error!("Client {} error: {}", addr, e);
            }
            info!("Client disconnected: {}", addr);
        });
    }

    Ok(())
}
