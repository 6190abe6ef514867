// CLI entry point for the disclite chat relay.
//
// Starts a standalone relay that chat clients connect to, then waits for
// Ctrl+C and shuts down cleanly (closing every session). See `server.rs`
// for the networking architecture and `router.rs` for routing rules.
//
// Usage:
//   relay [OPTIONS]
//     --host <HOST>         Listen address (default: 0.0.0.0)
//     --port <PORT>         Listen port (default: 8080)
//     --chat-log <PATH>     Chat log snapshot file (default: chat_log.json)
//     --no-chat-log         Keep the chat log in memory only
//     --debug               Verbose logging (overridden by RUST_LOG)

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::mpsc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use disclite_relay::server::{DEFAULT_CHAT_LOG, DEFAULT_PORT, RelayConfig, start_relay};

#[derive(Parser, Debug)]
#[command(name = "relay", version, about = "disclite chat relay")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Chat log snapshot file
    #[arg(long, default_value = DEFAULT_CHAT_LOG)]
    chat_log: PathBuf,

    /// Do not read or write a chat log file
    #[arg(long, conflicts_with = "chat_log")]
    no_chat_log: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            bind_addr: SocketAddr::new(self.host, self.port),
            chat_log_path: (!self.no_chat_log).then(|| self.chat_log.clone()),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "debug"
    } else {
        "info,disclite_relay=debug"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)),
        )
        .init();

    info!("Starting disclite relay v{}", env!("CARGO_PKG_VERSION"));

    let config = cli.relay_config();
    let (handle, addr) = start_relay(config).context("failed to start relay")?;
    info!(%addr, "Press Ctrl+C to stop");

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("failed to install Ctrl+C handler")?;

    // Either a signal or a dropped sender means stop.
    let _ = stop_rx.recv();
    info!("Shutting down");
    handle.stop();
    Ok(())
}
