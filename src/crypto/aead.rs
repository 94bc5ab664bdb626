//! XChaCha20-Poly1305 AEAD cipher
//!
//! The extended 24-byte nonce is drawn fresh from the system CSPRNG
//! for every sealing, which keeps random generation safe without any
//! counter state shared between peers. Sealed payloads are laid out
//! as `nonce || ciphertext || tag`.

use super::{CryptoError, KEY_LEN, NONCE_LEN, OVERHEAD};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};

/// AEAD cipher shared by both directions of a tunnel link
pub struct Cipher {
    inner: XChaCha20Poly1305,
}

impl Cipher {
    /// Create a cipher from a 32-byte key
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength);
        }
        Ok(Self {
            inner: XChaCha20Poly1305::new_from_slice(key)
                .map_err(|_| CryptoError::InvalidKeyLength)?,
        })
    }

    /// Seal `plaintext` under a fresh random nonce.
    ///
    /// The output is `OVERHEAD` bytes longer than the input.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        super::random_bytes(&mut nonce);

        let ciphertext = self
            .inner
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encryption)?;

        let mut sealed = Vec::with_capacity(plaintext.len() + OVERHEAD);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a sealed payload, verifying the authentication tag
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < OVERHEAD {
            return Err(CryptoError::CiphertextTooShort);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.inner
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Authentication)
    }

    /// Clone sharing the same key material
    pub(crate) fn duplicate(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let key = [0x42u8; KEY_LEN];
        let cipher = Cipher::new(&key).unwrap();

        let plaintext = b"Hello, World!";
        let sealed = cipher.encrypt(plaintext).unwrap();
        let opened = cipher.decrypt(&sealed).unwrap();

        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_overhead() {
        // Known vector: zero key, "hello" seals to exactly 45 bytes
        let key = [0u8; KEY_LEN];
        let cipher = Cipher::new(&key).unwrap();

        let sealed = cipher.encrypt(b"hello").unwrap();
        assert_eq!(sealed.len(), 5 + OVERHEAD);
        assert_eq!(sealed.len(), 45);
        assert_eq!(cipher.decrypt(&sealed).unwrap(), b"hello");
    }

    #[test]
    fn test_empty_plaintext() {
        let key = [7u8; KEY_LEN];
        let cipher = Cipher::new(&key).unwrap();

        let sealed = cipher.encrypt(b"").unwrap();
        assert_eq!(sealed.len(), OVERHEAD);
        assert!(cipher.decrypt(&sealed).unwrap().is_empty());
    }

    #[test]
    fn test_tamper_detection() {
        let key = [0x42u8; KEY_LEN];
        let cipher = Cipher::new(&key).unwrap();

        let mut sealed = cipher.encrypt(b"Hello, World!").unwrap();
        sealed[NONCE_LEN] ^= 0xFF;

        assert!(matches!(
            cipher.decrypt(&sealed),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn test_wrong_key() {
        let cipher_a = Cipher::new(&[1u8; KEY_LEN]).unwrap();
        let cipher_b = Cipher::new(&[2u8; KEY_LEN]).unwrap();

        let sealed = cipher_a.encrypt(b"secret").unwrap();
        assert!(cipher_b.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_bad_key_length() {
        assert!(matches!(
            Cipher::new(&[0u8; 16]),
            Err(CryptoError::InvalidKeyLength)
        ));
    }

    #[test]
    fn test_short_ciphertext() {
        let cipher = Cipher::new(&[0u8; KEY_LEN]).unwrap();
        assert!(matches!(
            cipher.decrypt(&[0u8; 10]),
            Err(CryptoError::CiphertextTooShort)
        ));
    }
}
