//! Tunnel layer - encrypted packet channel over a byte stream
//!
//! Provides:
//! - An encrypted, length-prefixed byte-stream wrapper
//! - A typed façade exchanging batches of router packets
//! - The proxy loop that pumps a router through a tunnel link
//!
//! Packet batches are serialized with bincode. Every `send` emits the
//! batch as exactly one wrapper frame and `recv` consumes exactly
//! one, so frame boundaries double as record boundaries; both peers
//! of a link are built from this crate and share the convention. An
//! absent payload and an empty payload are indistinguishable once
//! decoded.

mod wrapper;

pub use wrapper::Wrapper;

use crate::router::{Packet, Router};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("Frame length overflows 64 bits")]
    VarintOverflow,

    #[error("Record codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Maximum packets drained from a router per batch
pub const BATCH_SIZE: usize = 4096;

/// Typed message façade over an encrypted wrapper.
///
/// Send and receive sides lock independently, so a tunnel can be
/// pumped full-duplex from two tasks.
pub struct Tunnel<S> {
    wrapper: Wrapper<S>,
}

impl<S: AsyncRead + AsyncWrite> Tunnel<S> {
    /// Bind `conn` and a 32-byte key into a packet tunnel
    pub fn new(conn: S, key: &[u8]) -> Result<Self, crate::crypto::CryptoError> {
        Ok(Self {
            wrapper: Wrapper::new(conn, key)?,
        })
    }

    /// Serialize a batch of packets and transmit it as one frame
    pub async fn send(&self, packets: &[Packet]) -> Result<(), TunnelError> {
        let record = bincode::serialize(packets)?;
        self.wrapper.write(&record).await?;
        Ok(())
    }

    /// Receive the next batch of packets
    pub async fn recv(&self) -> Result<Vec<Packet>, TunnelError> {
        let record = self.wrapper.read_message().await?;
        Ok(bincode::deserialize(&record)?)
    }

    /// Continuously proxy packets between `router` and this tunnel.
    ///
    /// Runs an uplink (router outbound queue to tunnel) and a
    /// downlink (tunnel to router ingest) concurrently and returns
    /// the error of whichever direction fails first. The caller is
    /// responsible for redialing.
    pub async fn proxy_with_router(&self, router: &Router) -> TunnelError {
        let uplink = async {
            loop {
                let batch = router.next_batch(BATCH_SIZE).await;
                if let Err(e) = self.send(&batch).await {
                    break e;
                }
            }
        };

        let downlink = async {
            loop {
                match self.recv().await {
                    Ok(batch) => router.ingest(batch).await,
                    Err(e) => break e,
                }
            }
        };

        tokio::select! {
            e = uplink => e,
            e = downlink => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_LEN;
    use crate::router::{Endpoint, StreamId};
    use bytes::Bytes;

    fn tunnel_pair() -> (Tunnel<tokio::io::DuplexStream>, Tunnel<tokio::io::DuplexStream>) {
        let mut key = [0u8; KEY_LEN];
        crate::crypto::random_bytes(&mut key);
        let (a, b) = tokio::io::duplex(1 << 22);
        (Tunnel::new(a, &key).unwrap(), Tunnel::new(b, &key).unwrap())
    }

    fn random_text(len: usize) -> String {
        let mut raw = vec![0u8; len];
        crate::crypto::random_bytes(&mut raw);
        raw.iter().map(|b| (b'a' + b % 26) as char).collect()
    }

    #[tokio::test]
    async fn test_send_recv_roundtrip() {
        let (near, far) = tunnel_pair();

        let id = StreamId::random();
        let batch = vec![
            Packet::open(id.clone(), Endpoint::new("tcp", "example.com:80")),
            Packet::data(id.clone(), Bytes::from_static(b"GET / HTTP/1.1\r\n")),
            Packet::close(id),
        ];

        near.send(&batch).await.unwrap();
        let received = far.recv().await.unwrap();
        assert_eq!(received, batch);
    }

    #[tokio::test]
    async fn test_randomized_batch_roundtrip() {
        let (near, far) = tunnel_pair();

        // 100 packets with random ids, endpoints, and payloads of
        // length 0..=4096
        let batch: Vec<Packet> = (0..100)
            .map(|i| {
                let id = StreamId::random();
                match i % 3 {
                    0 => Packet::open(id, Endpoint::new(random_text(16), random_text(16))),
                    1 => {
                        let mut len = [0u8; 2];
                        crate::crypto::random_bytes(&mut len);
                        let len = (u16::from_le_bytes(len) % 4097) as usize;
                        let mut payload = vec![0u8; len];
                        crate::crypto::random_bytes(&mut payload);
                        Packet::data(id, Bytes::from(payload))
                    }
                    _ => Packet::close(id),
                }
            })
            .collect();

        let send = near.send(&batch);
        let recv = far.recv();
        let (sent, received) = tokio::join!(send, recv);
        sent.unwrap();
        assert_eq!(received.unwrap(), batch);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let (near, far) = tunnel_pair();

        near.send(&[]).await.unwrap();
        assert!(far.recv().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batches_preserve_order() {
        let (near, far) = tunnel_pair();

        let id = StreamId::random();
        for i in 0u8..10 {
            let batch = vec![Packet::data(id.clone(), Bytes::from(vec![i; 8]))];
            near.send(&batch).await.unwrap();
        }

        for i in 0u8..10 {
            let batch = far.recv().await.unwrap();
            assert_eq!(batch.len(), 1);
            assert_eq!(batch[0].data.as_ref(), &[i; 8]);
        }
    }
}
