//! Mirage Tunnel Client
//!
//! Runs a local SOCKS5 proxy and carries every accepted connection
//! to the server through the configured carrier (raw TCP or HTTPS).

use anyhow::{Context, Result};
use clap::Parser;
use mirage_tunnel::{
    carrier::{https::HttpsClient, tcp::TcpClient},
    config::{Configuration, Protocol},
    proxy::Socks5Server,
    router::Client,
};
use std::sync::Arc;
use tracing::info;

/// Mirage Tunnel Client
#[derive(Parser, Debug)]
#[command(name = "mirage-client")]
#[command(about = "Mirage tunnel client - local SOCKS5 proxy over a disguised carrier")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// SOCKS5 listen port on localhost (overridden by the socksPort
    /// config key)
    #[arg(long, default_value_t = 1080)]
    socks_port: u16,

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

    let client: Arc<dyn Client> = match conf.protocol()? {
        Protocol::Tcp => Arc::new(TcpClient::new(&conf)?),
        Protocol::Https => Arc::new(HttpsClient::new(&conf)?),
    };

    let socks_port = if conf.get("socksPort").is_empty() {
        args.socks_port
    } else {
        conf.port("socksPort")?
    };

    let socks = Socks5Server::bind(&format!("127.0.0.1:{}", socks_port))
        .await
        .context("Failed to bind SOCKS5 listener")?;

    info!("Mirage client v{} ready", mirage_tunnel::VERSION);
    socks.run(client).await?;
    Ok(())
}
