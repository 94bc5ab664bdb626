//! Raw TCP carrier
//!
//! One encrypted TCP link per client. The link is wrapped in a
//! packet tunnel keyed by the shared auth token and pumped against
//! the local router; the client side redials with backoff whenever
//! the link drops, leaving in-flight streams to the router.

use super::CarrierError;
use crate::config::Configuration;
use crate::router::{Client, Endpoint, Router};
use crate::tunnel::Tunnel;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(15);

/// Client side of the TCP carrier
pub struct TcpClient {
    router: Router,
}

impl TcpClient {
    /// Dial the configured server and keep the link alive in the
    /// background
    pub fn new(conf: &Configuration) -> Result<Self, crate::Error> {
        let key = conf.decode_key("authToken")?;
        let port = conf.port("serverPort")?;
        let host = conf.get("serverAddr");
        if host.is_empty() {
            return Err(crate::Error::Config("serverAddr must be specified".into()));
        }
        let addr = format!("{}:{}", host, port);

        let router = Router::new();
        tokio::spawn(run_client_link(addr, key, router.clone()));

        Ok(Self { router })
    }
}

#[async_trait]
impl Client for TcpClient {
    async fn handle_connection(&self, dest: Endpoint, conn: TcpStream) -> std::io::Result<()> {
        self.router.open_local(dest, conn).await;
        Ok(())
    }
}

/// Dial, pump, redial. Backoff doubles up to a cap and resets after
/// a link was successfully established.
async fn run_client_link(addr: String, key: Vec<u8>, router: Router) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match TcpStream::connect(&addr).await {
            Ok(conn) => {
                conn.set_nodelay(true).ok();
                let tunnel = match Tunnel::new(conn, &key) {
                    Ok(t) => t,
                    Err(e) => {
                        error!("Cannot key the carrier tunnel: {}", e);
                        return;
                    }
                };
                info!("Carrier link to {} established", addr);
                backoff = INITIAL_BACKOFF;

                let err = tunnel.proxy_with_router(&router).await;
                warn!("Carrier link to {} lost: {}", addr, err);
            }
            Err(e) => {
                warn!("Failed to dial {}: {}", addr, e);
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Server side of the TCP carrier.
///
/// Every accepted connection gets its own tunnel; all tunnels feed
/// the same router.
pub struct TcpServer {
    router: Router,
    key: Vec<u8>,
    port: u16,
}

impl TcpServer {
    /// Build a server from the configuration
    pub fn new(conf: &Configuration) -> Result<Self, crate::Error> {
        Ok(Self {
            router: Router::new(),
            key: conf.decode_key("authToken")?,
            port: conf.port("serverPort")?,
        })
    }

    /// Accept and serve carrier connections forever
    pub async fn start(&self) -> Result<(), crate::Error> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(CarrierError::Io)?;
        info!("TCP carrier listening on 0.0.0.0:{}", self.port);

        loop {
            let (conn, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept error: {}", e);
                    continue;
                }
            };
            conn.set_nodelay(true).ok();

            let key = self.key.clone();
            let router = self.router.clone();
            tokio::spawn(async move {
                let tunnel = match Tunnel::new(conn, &key) {
                    Ok(t) => t,
                    Err(e) => {
                        error!("Cannot key the carrier tunnel: {}", e);
                        return;
                    }
                };
                debug!("Carrier connection from {}", peer);
                let err = tunnel.proxy_with_router(&router).await;
                debug!("Carrier connection from {} ended: {}", peer, err);
            });
        }
    }
}
