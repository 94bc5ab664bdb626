//! # Mirage Tunnel
//!
//! A traffic-obfuscating tunnel that carries arbitrary TCP
//! connections through a single encrypted carrier link disguised as
//! an ordinary HTTPS site.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 SOCKS5 Front End                     │
//! │        (local applications dial through here)        │
//! ├─────────────────────────────────────────────────────┤
//! │                 Multiplex Router                     │
//! │   (many streams ⇄ one ordered packet sequence)       │
//! ├─────────────────────────────────────────────────────┤
//! │                  Packet Tunnel                       │
//! │     (AEAD framing, typed batches over any stream)    │
//! ├─────────────────────────────────────────────────────┤
//! │                     Carrier                          │
//! │   (HTTPS polling with decoy site, or raw TCP link)   │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The client runs a local SOCKS5 listener; endpoints named by SOCKS
//! clients are dialed by the server on the far side of the carrier,
//! and bytes flow both ways as identified packets. To an on-path
//! observer the HTTPS carrier is a TLS web server hosting a small
//! static site; only requests bearing the shared token reach the
//! proxy handler.

pub mod carrier;
pub mod config;
pub mod crypto;
pub mod proxy;
pub mod router;
pub mod tunnel;

pub use config::Configuration;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Carrier error: {0}")]
    Carrier(#[from] carrier::CarrierError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),
}
