//! Mirage Tunnel Server
//!
//! Terminates the carrier, dials the endpoints clients ask for, and
//! shuttles bytes between them. In HTTPS mode the public face is a
//! small static site; only requests bearing the shared token reach
//! the tunnel.

use anyhow::{Context, Result};
use clap::Parser;
use mirage_tunnel::{
    carrier::{https::HttpsServer, tcp::TcpServer},
    config::{Configuration, Protocol},
};
use tracing::info;

/// Mirage Tunnel Server
#[derive(Parser, Debug)]
#[command(name = "mirage-server")]
#[command(about = "Mirage tunnel server - carrier terminator and endpoint dialer")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    let conf = Configuration::load(&args.config).context("Failed to load configuration")?;

    info!("Mirage server v{}", mirage_tunnel::VERSION);

    match conf.protocol()? {
        Protocol::Tcp => TcpServer::new(&conf)?.start().await?,
        Protocol::Https => HttpsServer::new(&conf)?.start().await?,
    }

    Ok(())
}
