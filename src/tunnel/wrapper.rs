//! Encrypted framing over an arbitrary byte stream
//!
//! Wraps any duplex byte channel and a 32-byte key into a byte
//! stream with confidentiality and integrity. Each write becomes one
//! wire frame:
//!
//! ```text
//! +----------------------+---------------------------+
//! |  length field (10B)  |  nonce || ciphertext||tag |
//! +----------------------+---------------------------+
//! ```
//!
//! The length field is a fixed-width block holding an unsigned
//! LEB128 varint; readers always consume exactly ten bytes and
//! decode the prefix out of them, so the unused suffix stays on the
//! wire as zero padding. This fixed-width read is part of the frame
//! format and must match on both peers.

use super::TunnelError;
use crate::crypto::Cipher;
use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

/// Width of the on-wire length field (maximum encoded length of a
/// 64-bit varint)
pub const MAX_VARINT_LEN: usize = 10;

/// Encrypted byte-stream façade over a duplex channel.
///
/// Reads and writes are independently serialized, so one reader and
/// one writer may operate concurrently; two concurrent readers (or
/// writers) queue on the respective lock.
pub struct Wrapper<S> {
    reader: Mutex<FrameReader<S>>,
    writer: Mutex<FrameWriter<S>>,
}

struct FrameReader<S> {
    conn: ReadHalf<S>,
    cipher: Cipher,
    /// Plaintext left over from a frame that did not fit the
    /// caller's buffer
    residual: Bytes,
}

struct FrameWriter<S> {
    conn: WriteHalf<S>,
    cipher: Cipher,
}

impl<S: AsyncRead + AsyncWrite> Wrapper<S> {
    /// Bind `conn` and a 32-byte key into an encrypted stream
    pub fn new(conn: S, key: &[u8]) -> Result<Self, crate::crypto::CryptoError> {
        let cipher = Cipher::new(key)?;
        let (read_half, write_half) = tokio::io::split(conn);

        Ok(Self {
            reader: Mutex::new(FrameReader {
                conn: read_half,
                cipher: cipher.duplicate(),
                residual: Bytes::new(),
            }),
            writer: Mutex::new(FrameWriter {
                conn: write_half,
                cipher,
            }),
        })
    }

    /// Read decrypted bytes into `buf`.
    ///
    /// Serves residual plaintext from a previous frame first;
    /// otherwise reads and decrypts exactly one frame, buffering
    /// whatever does not fit.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        let mut reader = self.reader.lock().await;

        if !reader.residual.is_empty() {
            let n = buf.len().min(reader.residual.len());
            buf[..n].copy_from_slice(&reader.residual[..n]);
            reader.residual.advance(n);
            return Ok(n);
        }

        let data = reader.read_frame().await?;
        let n = buf.len().min(data.len());
        buf[..n].copy_from_slice(&data[..n]);
        if n < data.len() {
            let mut rest = Bytes::from(data);
            rest.advance(n);
            reader.residual = rest;
        }
        Ok(n)
    }

    /// Seal `plaintext` as a single frame and transmit it as one
    /// underlying write. Returns the number of plaintext bytes
    /// accepted, which is always `plaintext.len()` on success.
    pub async fn write(&self, plaintext: &[u8]) -> Result<usize, TunnelError> {
        let mut writer = self.writer.lock().await;
        writer.write_frame(plaintext).await?;
        Ok(plaintext.len())
    }

    /// Read exactly one frame's plaintext.
    ///
    /// Used by the typed tunnel, which aligns records to frames. Must
    /// not be mixed with partial `read` calls: any residual plaintext
    /// would be skipped.
    pub(crate) async fn read_message(&self) -> Result<Vec<u8>, TunnelError> {
        let mut reader = self.reader.lock().await;
        debug_assert!(reader.residual.is_empty());
        reader.read_frame().await
    }
}

impl<S: AsyncRead> FrameReader<S> {
    async fn read_frame(&mut self) -> Result<Vec<u8>, TunnelError> {
        let mut length_field = [0u8; MAX_VARINT_LEN];
        self.conn.read_exact(&mut length_field).await?;

        let length = uvarint(&length_field).ok_or(TunnelError::VarintOverflow)?;

        let mut ciphertext = vec![0u8; length as usize];
        self.conn.read_exact(&mut ciphertext).await?;

        Ok(self.cipher.decrypt(&ciphertext)?)
    }
}

impl<S: AsyncWrite> FrameWriter<S> {
    async fn write_frame(&mut self, plaintext: &[u8]) -> Result<(), TunnelError> {
        let ciphertext = self.cipher.encrypt(plaintext)?;

        let mut frame = vec![0u8; MAX_VARINT_LEN];
        put_uvarint(&mut frame, ciphertext.len() as u64);
        frame.extend_from_slice(&ciphertext);

        self.conn.write_all(&frame).await?;
        self.conn.flush().await?;
        Ok(())
    }
}

/// Encode `x` as an unsigned LEB128 varint into the front of `buf`,
/// returning the number of bytes used
fn put_uvarint(buf: &mut [u8], mut x: u64) -> usize {
    let mut i = 0;
    while x >= 0x80 {
        buf[i] = (x as u8) | 0x80;
        x >>= 7;
        i += 1;
    }
    buf[i] = x as u8;
    i + 1
}

/// Decode an unsigned LEB128 varint from the front of `buf`.
///
/// Returns `None` if the value overflows 64 bits or the buffer ends
/// mid-varint.
fn uvarint(buf: &[u8]) -> Option<u64> {
    let mut x: u64 = 0;
    let mut shift: u32 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i == MAX_VARINT_LEN {
            return None;
        }
        if byte < 0x80 {
            if i == MAX_VARINT_LEN - 1 && byte > 1 {
                return None;
            }
            return Some(x | (u64::from(byte) << shift));
        }
        x |= u64::from(byte & 0x7f) << shift;
        shift += 7;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KEY_LEN, OVERHEAD};

    #[test]
    fn test_uvarint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16384, u32::MAX as u64, u64::MAX] {
            let mut buf = [0u8; MAX_VARINT_LEN];
            put_uvarint(&mut buf, value);
            assert_eq!(uvarint(&buf), Some(value), "value {value}");
        }
    }

    #[test]
    fn test_uvarint_encoding() {
        let mut buf = [0u8; MAX_VARINT_LEN];
        assert_eq!(put_uvarint(&mut buf, 300), 2);
        assert_eq!(&buf[..2], &[0xAC, 0x02]);
    }

    #[test]
    fn test_uvarint_overflow() {
        // Eleven continuation bytes: value larger than 64 bits
        let buf = [0xFFu8; MAX_VARINT_LEN];
        assert_eq!(uvarint(&buf), None);

        // Tenth byte may only contribute a single bit
        let mut buf = [0x80u8; MAX_VARINT_LEN];
        buf[9] = 0x02;
        assert_eq!(uvarint(&buf), None);
    }

    fn wrapper_pair() -> (Wrapper<tokio::io::DuplexStream>, Wrapper<tokio::io::DuplexStream>) {
        let mut key = [0u8; KEY_LEN];
        crate::crypto::random_bytes(&mut key);
        let (a, b) = tokio::io::duplex(1 << 20);
        (Wrapper::new(a, &key).unwrap(), Wrapper::new(b, &key).unwrap())
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (near, far) = wrapper_pair();

        let n = near.write(b"hello over the wire").await.unwrap();
        assert_eq!(n, 19);

        let mut buf = [0u8; 64];
        let n = far.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello over the wire");
    }

    #[tokio::test]
    async fn test_residual_buffering() {
        let (near, far) = wrapper_pair();

        near.write(b"abcdefgh").await.unwrap();

        // Drain the single frame through a 3-byte window; bytes must
        // arrive in order with nothing lost
        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        while out.len() < 8 {
            let n = far.read(&mut buf).await.unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"abcdefgh");
    }

    #[tokio::test]
    async fn test_stream_equivalence() {
        let (near, far) = wrapper_pair();

        let chunks: Vec<Vec<u8>> = vec![
            b"first".to_vec(),
            vec![],
            vec![0xAB; 4096],
            b"last".to_vec(),
        ];
        let total: usize = chunks.iter().map(Vec::len).sum();

        let sender = async {
            for chunk in &chunks {
                assert_eq!(near.write(chunk).await.unwrap(), chunk.len());
            }
        };
        let receiver = async {
            let mut out = Vec::new();
            let mut buf = [0u8; 1000];
            while out.len() < total {
                let n = far.read(&mut buf).await.unwrap();
                out.extend_from_slice(&buf[..n]);
            }
            out
        };

        let (_, received) = tokio::join!(sender, receiver);
        let expected: Vec<u8> = chunks.concat();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_key_mismatch_rejected() {
        let (a, b) = tokio::io::duplex(4096);
        let near = Wrapper::new(a, &[1u8; KEY_LEN]).unwrap();
        let far = Wrapper::new(b, &[2u8; KEY_LEN]).unwrap();

        near.write(b"sealed under the wrong key").await.unwrap();

        let mut buf = [0u8; 64];
        assert!(matches!(
            far.read(&mut buf).await,
            Err(TunnelError::Crypto(_))
        ));
    }

    #[tokio::test]
    async fn test_frame_overhead_on_wire() {
        let mut key = [0u8; KEY_LEN];
        crate::crypto::random_bytes(&mut key);
        let (a, mut b) = tokio::io::duplex(4096);
        let near = Wrapper::new(a, &key).unwrap();

        near.write(b"hello").await.unwrap();

        let mut wire = [0u8; 128];
        let n = b.read(&mut wire).await.unwrap();
        assert_eq!(n, MAX_VARINT_LEN + 5 + OVERHEAD);
        assert_eq!(uvarint(&wire[..MAX_VARINT_LEN]), Some(5 + OVERHEAD as u64));
    }
}
