//! Payload encryption.
//!
//! Ciphers only ever see one envelope payload at a time. File transfers are
//! sealed chunk by chunk, so nothing here needs to hold a whole file.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::types::{Result, TetherError};

/// Nonce length prepended to every sealed payload
pub const NONCE_LEN: usize = 12;

/// Poly1305 tag length appended by the AEAD
pub const TAG_LEN: usize = 16;

/// A reversible payload transform.
///
/// `seal` runs before the header length is computed, so the declared length
/// always matches the sealed size. `open` is only called once the whole
/// sealed payload has arrived.
pub trait PayloadCipher: Send + Sync + fmt::Debug {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>>;

    /// Bytes added by `seal` on top of the plaintext length
    fn overhead(&self) -> usize;
}

/// ChaCha20-Poly1305 with a random nonce per payload.
///
/// Sealed layout: `nonce (12) | ciphertext | tag (16)`.
pub struct ChaChaCipher {
    cipher: ChaCha20Poly1305,
}

impl ChaChaCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }

    /// Derive the key as the SHA-256 digest of a shared passphrase
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self::new(key)
    }
}

impl fmt::Debug for ChaChaCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChaChaCipher").finish_non_exhaustive()
    }
}

impl PayloadCipher for ChaChaCipher {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| TetherError::Crypto("payload seal failed".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(TetherError::Crypto(format!(
                "sealed payload too short: {} bytes",
                sealed.len()
            )));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| TetherError::Crypto("payload authentication failed".into()))
    }

    fn overhead(&self) -> usize {
        NONCE_LEN + TAG_LEN
    }
}
