//! # Token Cipher
//!
//! Authenticated symmetric encryption for OAuth tokens and backend secrets
//! using AES-256-GCM.
//!
//! Every database column suffixed `_encrypted` holds the output of
//! [`TokenCipher::seal`]. The cipher is keyed by the `ENCRYPTION_KEY`
//! environment secret; a missing or short key is a fatal startup error.
//!
//! Sealed format: base64(nonce || ciphertext || auth_tag).

use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::constants::MIN_ENCRYPTION_KEY_BYTES;

/// Size of the nonce for AES-GCM (12 bytes)
const NONCE_SIZE: usize = 12;

/// Environment variable holding the key material
pub const ENCRYPTION_KEY_ENV: &str = "ENCRYPTION_KEY";

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("{ENCRYPTION_KEY_ENV} is not set")]
    MissingKey,
    #[error("{ENCRYPTION_KEY_ENV} must be at least {MIN_ENCRYPTION_KEY_BYTES} bytes, got {0}")]
    KeyTooShort(usize),
    #[error("ciphertext is not valid base64")]
    Encoding,
    #[error("ciphertext is truncated")]
    Truncated,
    #[error("decryption failed: ciphertext tampered or wrong key")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
}

/// Authenticated cipher for secret blobs at rest.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
    key: [u8; 32],
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

impl TokenCipher {
    /// Build a cipher from raw key material (minimum 32 bytes).
    ///
    /// The AES key is the SHA-256 digest of the material, so any sufficiently
    /// long secret works without manual truncation.
    pub fn new(key_material: &[u8]) -> Result<Self, CipherError> {
        if key_material.len() < MIN_ENCRYPTION_KEY_BYTES {
            return Err(CipherError::KeyTooShort(key_material.len()));
        }
        let key: [u8; 32] = Sha256::digest(key_material).into();
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CipherError::Encrypt)?;
        Ok(Self { cipher, key })
    }

    /// Build a cipher from the `ENCRYPTION_KEY` environment variable.
    pub fn from_env() -> Result<Self, CipherError> {
        let material = std::env::var(ENCRYPTION_KEY_ENV).map_err(|_| CipherError::MissingKey)?;
        Self::new(material.as_bytes())
    }

    /// Derived key bytes, shared with the file-proxy URL signer.
    pub fn signing_key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Encrypt a plaintext into an opaque base64 string.
    pub fn seal(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    /// Decrypt an opaque string produced by [`seal`](Self::seal).
    pub fn open(&self, sealed: &str) -> Result<String, CipherError> {
        let raw = BASE64.decode(sealed).map_err(|_| CipherError::Encoding)?;
        if raw.len() <= NONCE_SIZE {
            return Err(CipherError::Truncated);
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CipherError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| CipherError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> TokenCipher {
        TokenCipher::new(b"0123456789abcdef0123456789abcdef").expect("valid key")
    }

    #[test]
    fn test_roundtrip() {
        let c = cipher();
        let sealed = c.seal("gho_supersecrettoken").unwrap();
        assert_ne!(sealed, "gho_supersecrettoken");
        assert_eq!(c.open(&sealed).unwrap(), "gho_supersecrettoken");
    }

    #[test]
    fn test_seal_is_randomized() {
        let c = cipher();
        assert_ne!(c.seal("x").unwrap(), c.seal("x").unwrap());
    }

    #[test]
    fn test_bit_flip_detected() {
        let c = cipher();
        let sealed = c.seal("payload").unwrap();
        let mut raw = BASE64.decode(&sealed).unwrap();
        // Flip one bit in every byte position; each must fail authentication.
        for i in 0..raw.len() {
            raw[i] ^= 0x01;
            let tampered = BASE64.encode(&raw);
            assert!(c.open(&tampered).is_err(), "flip at byte {i} not detected");
            raw[i] ^= 0x01;
        }
    }

    #[test]
    fn test_short_key_rejected() {
        assert!(matches!(
            TokenCipher::new(b"too-short"),
            Err(CipherError::KeyTooShort(9))
        ));
    }

    #[test]
    fn test_garbage_inputs() {
        let c = cipher();
        assert!(c.open("not-base64!!!").is_err());
        assert!(c.open("").is_err());
        assert!(c.open(&BASE64.encode([0u8; 4])).is_err());
    }
}
