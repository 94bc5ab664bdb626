//! Packet model for the multiplex router
//!
//! Every multiplexed connection is carried as a sequence of tagged
//! packets: one `Open` naming the destination, any number of `Data`
//! packets, and a final `Close` from whichever side dies first.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A dial target on the far side of the tunnel.
///
/// `network` is an opaque transport name (currently only `"tcp"` is
/// dialable) and `address` is `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub network: String,
    pub address: String,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.address)
    }
}

/// 128-bit random stream identifier, rendered as unpadded base64.
///
/// Ids are generated once per stream and used as map keys on both
/// ends; collisions within a process lifetime are treated as
/// impossible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Generate a fresh random stream id
    pub fn random() -> Self {
        let mut raw = [0u8; 16];
        crate::crypto::random_bytes(&mut raw);
        Self(STANDARD_NO_PAD.encode(raw))
    }

    /// The base64 rendering used on the wire
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle tag carried by every packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketKind {
    /// Open a new stream to the carried destination
    Open,
    /// Payload bytes for an existing stream
    Data,
    /// Close the stream and clean up
    Close,
}

/// A single routed message.
///
/// `Open` packets carry `dest` and no payload; `Data` packets carry a
/// (possibly empty) payload and no `dest`; `Close` packets carry
/// neither. An absent payload and an empty payload are identical on
/// the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub id: StreamId,
    pub kind: PacketKind,
    pub dest: Option<Endpoint>,
    pub data: Bytes,
}

impl Packet {
    /// Packet announcing a new stream to `dest`
    pub fn open(id: StreamId, dest: Endpoint) -> Self {
        Self {
            id,
            kind: PacketKind::Open,
            dest: Some(dest),
            data: Bytes::new(),
        }
    }

    /// Payload packet for an existing stream
    pub fn data(id: StreamId, data: Bytes) -> Self {
        Self {
            id,
            kind: PacketKind::Data,
            dest: None,
            data,
        }
    }

    /// Packet signalling a closed stream
    pub fn close(id: StreamId) -> Self {
        Self {
            id,
            kind: PacketKind::Close,
            dest: None,
            data: Bytes::new(),
        }
    }

    /// True if this packet opens a stream that does not exist yet
    pub fn is_open(&self) -> bool {
        self.kind == PacketKind::Open
    }

    /// True if this packet closes its stream
    pub fn is_close(&self) -> bool {
        self.kind == PacketKind::Close
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_unique() {
        let a = StreamId::random();
        let b = StreamId::random();
        assert_ne!(a, b);
        // 16 bytes -> 22 base64 chars, no padding
        assert_eq!(a.as_str().len(), 22);
        assert!(!a.as_str().contains('='));
    }

    #[test]
    fn test_constructors() {
        let id = StreamId::random();

        let open = Packet::open(id.clone(), Endpoint::new("tcp", "example.com:443"));
        assert!(open.is_open());
        assert!(!open.is_close());
        assert_eq!(open.dest.as_ref().unwrap().address, "example.com:443");
        assert!(open.data.is_empty());

        let data = Packet::data(id.clone(), Bytes::from_static(b"payload"));
        assert!(!data.is_open());
        assert!(data.dest.is_none());

        let close = Packet::close(id);
        assert!(close.is_close());
        assert!(close.dest.is_none());
        assert!(close.data.is_empty());
    }
}
