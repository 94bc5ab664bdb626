//! Configuration management
//!
//! A configuration is a flat string-to-string map serialized as
//! JSON, produced by the setup wizard on the operator's machine and
//! consumed verbatim by both binaries. Typed accessors validate the
//! handful of keys the core cares about.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::crypto::KEY_LEN;

/// Which carrier protocol a configuration selects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Https,
}

/// Flat key/value configuration blob
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration(HashMap<String, String>);

impl Configuration {
    /// Load a configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            crate::Error::Config(format!(
                "failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        serde_json::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("failed to parse config: {}", e)))
    }

    /// Look up a key, returning the empty string when absent (keys
    /// the wizard did not write behave like empty values)
    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or("")
    }

    /// The configured carrier protocol. A missing protocol is a
    /// fatal configuration error.
    pub fn protocol(&self) -> Result<Protocol, crate::Error> {
        match self.get("protocol") {
            "" => Err(crate::Error::Config(
                "protocol must be specified in config file".into(),
            )),
            "tcp" => Ok(Protocol::Tcp),
            "https" => Ok(Protocol::Https),
            other => Err(crate::Error::Config(format!("unknown protocol: {}", other))),
        }
    }

    /// Decode `key` as unpadded base64 holding exactly 32 bytes.
    ///
    /// The auth token doubles as the AEAD key on the TCP carrier.
    pub fn decode_key(&self, key: &str) -> Result<Vec<u8>, crate::Error> {
        let raw = STANDARD_NO_PAD
            .decode(self.get(key))
            .map_err(|e| crate::Error::Config(format!("{} is not valid base64: {}", key, e)))?;
        if raw.len() != KEY_LEN {
            return Err(crate::Error::Config(format!(
                "{} must decode to exactly {} bytes",
                key, KEY_LEN
            )));
        }
        Ok(raw)
    }

    /// Parse `key` as a port number in 1-65535
    pub fn port(&self, key: &str) -> Result<u16, crate::Error> {
        let port: u32 = self
            .get(key)
            .parse()
            .map_err(|_| crate::Error::Config(format!("{} must be a port number", key)))?;
        if port == 0 || port > 65535 {
            return Err(crate::Error::Config(format!(
                "{} must be in the range 1-65535",
                key
            )));
        }
        Ok(port as u16)
    }

    #[cfg(test)]
    pub(crate) fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}
