//! `tether` binary: loads configuration, starts the server and stops it on
//! Ctrl-C.

use std::path::PathBuf;

use clap::Parser;
use tether::{ServerConfig, TetherError, TetherServer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tether", about = "Session-continuity game server")]
struct Args {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// TCP listen address, overrides the config file.
    #[arg(long)]
    tcp: Option<String>,

    /// WebSocket listen address, overrides the config file.
    #[arg(long)]
    ws: Option<String>,
}

impl Args {
    fn apply_overrides(&self, config: &mut ServerConfig) {
        if let Some(ref addr) = self.tcp {
            config.tcp_addr = Some(addr.clone());
        }
        if let Some(ref addr) = self.ws {
            config.ws_addr = Some(addr.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), TetherError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    args.apply_overrides(&mut config);

    let server = TetherServer::builder().config(config).build().await?;
    if let Some(addr) = server.tcp_addr() {
        info!(%addr, "tcp listener ready");
    }
    if let Some(addr) = server.ws_addr() {
        info!(%addr, "websocket listener ready");
    }

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("ctrl-c received");
                shutdown.trigger();
            }
            Err(e) => error!(error = %e, "cannot listen for ctrl-c"),
        }
    });

    server.run().await
}
