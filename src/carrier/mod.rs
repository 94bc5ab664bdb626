//! Carrier implementations
//!
//! A carrier is the outer transport that moves packet batches
//! between the two routers: either a single encrypted TCP link or a
//! polling HTTPS exchange that looks like an ordinary web site.

pub mod https;
pub mod tcp;

use thiserror::Error;

/// Carrier errors
#[derive(Debug, Error)]
pub enum CarrierError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(String),
}
