//! HTTPS carrier client
//!
//! A single poll loop drains the router into `POST` bodies and
//! ingests whatever the server sends back. Transport failures are
//! retried with the same `ID` header so the server can replay its
//! cached response instead of double-applying the request. When both
//! directions are idle the loop sleeps a uniformly random slice of
//! up to 100 ms before polling again.

use super::{AUTH_HEADER, CLIENT_BUFFER, ID_HEADER};
use crate::carrier::CarrierError;
use crate::config::Configuration;
use crate::router::{Client, Endpoint, Packet, Router};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use bytes::Bytes;
use rand::Rng;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{error, info, warn};

/// Ceiling of the idle cover-traffic sleep
const IDLE_SLEEP_MAX_MS: u64 = 100;

/// Pause before retrying a failed round-trip with the same `ID`
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Client side of the HTTPS carrier
pub struct HttpsClient {
    router: Router,
}

impl HttpsClient {
    /// Build the HTTP client from the configuration and start the
    /// poll loop in the background
    pub fn new(conf: &Configuration) -> Result<Self, crate::Error> {
        let remote = conf.get("proxyAddr").to_string();
        if !remote.starts_with("https://") {
            return Err(crate::Error::Config(
                "proxyAddr must start with https://".into(),
            ));
        }
        let token = conf.get("authToken").to_string();
        let http = build_http_client(conf)?;

        let router = Router::new();
        tokio::spawn(poll_loop(http, remote, token, router.clone()));

        Ok(Self { router })
    }
}

#[async_trait]
impl Client for HttpsClient {
    async fn handle_connection(&self, dest: Endpoint, conn: TcpStream) -> std::io::Result<()> {
        self.router.open_local(dest, conn).await;
        Ok(())
    }
}

fn build_http_client(conf: &Configuration) -> Result<reqwest::Client, crate::Error> {
    let mut builder = reqwest::Client::builder().use_rustls_tls();

    if conf.get("pinRootCA") == "yes" {
        let pem = STANDARD_NO_PAD.decode(conf.get("tlsCert")).map_err(|e| {
            crate::Error::Config(format!("tlsCert is not valid base64: {}", e))
        })?;
        let root = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| crate::Error::Config(format!("tlsCert is not a certificate: {}", e)))?;
        builder = builder
            .tls_built_in_root_certs(false)
            .add_root_certificate(root);
    }

    builder
        .build()
        .map_err(|e| CarrierError::Http(e.to_string()).into())
}

/// Fresh base64 nonce naming one logical request
fn request_id() -> String {
    let mut raw = [0u8; 16];
    crate::crypto::random_bytes(&mut raw);
    STANDARD_NO_PAD.encode(raw)
}

async fn poll_loop(http: reqwest::Client, remote: String, token: String, router: Router) {
    info!("HTTPS carrier polling {}", remote);

    loop {
        let outbound = router.fill(CLIENT_BUFFER).await;
        let body = match serde_json::to_vec(&outbound) {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to encode carrier payload: {}", e);
                return;
            }
        };
        let id = request_id();

        // Retry transport failures with the same ID; the server's
        // replay slot keeps the effect at-most-once.
        let response = loop {
            match round_trip(&http, &remote, &id, &token, body.clone()).await {
                Ok((status, bytes)) if status == StatusCode::OK => break bytes,
                Ok((status, bytes)) => {
                    error!(
                        "Carrier teardown, server returned {}: {}",
                        status,
                        String::from_utf8_lossy(&bytes)
                    );
                    return;
                }
                Err(e) => {
                    warn!("Carrier round-trip failed, retrying: {}", e);
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        };

        let incoming: Vec<Packet> = match serde_json::from_slice(&response) {
            Ok(packets) => packets,
            Err(e) => {
                error!(
                    "Carrier teardown, cannot decode response (wrong auth token?): {}",
                    e
                );
                return;
            }
        };

        let busy =
            !outbound.is_empty() || !incoming.is_empty() || router.queue_len().await > 0;

        let ingestor = router.clone();
        tokio::spawn(async move { ingestor.ingest(incoming).await });

        if busy {
            continue;
        }

        let pause = rand::thread_rng().gen_range(0..IDLE_SLEEP_MAX_MS);
        tokio::time::sleep(Duration::from_millis(pause)).await;
    }
}

async fn round_trip(
    http: &reqwest::Client,
    remote: &str,
    id: &str,
    token: &str,
    body: Vec<u8>,
) -> Result<(StatusCode, Bytes), CarrierError> {
    let response = http
        .post(remote)
        .header(ID_HEADER, id)
        .header(AUTH_HEADER, token)
        .body(body)
        .send()
        .await
        .map_err(|e| CarrierError::Http(e.to_string()))?;

    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| CarrierError::Http(e.to_string()))?;
    Ok((status, bytes))
}
