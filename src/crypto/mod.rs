//! Cryptographic primitives for the tunnel
//!
//! Provides:
//! - XChaCha20-Poly1305 AEAD encryption with random nonces
//! - Secure random number generation

mod aead;

pub use aead::Cipher;

use thiserror::Error;

/// Length of the symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of the XChaCha20 nonce in bytes
pub const NONCE_LEN: usize = 24;

/// Length of the Poly1305 authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Bytes added to every sealed payload (nonce prefix + tag suffix)
pub const OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key must be exactly {KEY_LEN} bytes")]
    InvalidKeyLength,

    #[error("Ciphertext too short")]
    CiphertextTooShort,

    #[error("Encryption failed")]
    Encryption,

    /// The ciphertext did not authenticate under this key. Callers
    /// must surface this; retrying with a different key is not
    /// permitted.
    #[error("Authentication failed")]
    Authentication,
}

/// Fill `buf` with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("system CSPRNG failed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1);
        random_bytes(&mut buf2);
        assert_ne!(buf1, buf2);
    }
}
