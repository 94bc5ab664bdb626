//! HTTPS carrier
//!
//! Turns the router's bidirectional packet flow into a sequence of
//! `POST /` exchanges against what looks like an ordinary TLS web
//! site. Authenticated requests reach the proxy handler; everything
//! else gets the embedded decoy site. Batches travel as JSON bodies;
//! request replay is made safe by a per-request `ID` header and a
//! single-slot response cache on the server.

mod certs;
pub mod client;
mod decoy;
pub mod server;

pub use certs::CertificateStore;
pub use client::HttpsClient;
pub use server::{HttpsServer, ServerHandle};

/// Maximum packets per poll request / response
pub(crate) const CLIENT_BUFFER: usize = 4096;
pub(crate) const SERVER_BUFFER: usize = 4096;

/// Header naming the logical request for idempotent replay
pub(crate) const ID_HEADER: &str = "ID";

/// Bearer-token header checked by the server
pub(crate) const AUTH_HEADER: &str = "Auth-Token";
