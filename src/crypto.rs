//! Credential encryption at rest.
//!
//! Tokens are sealed with AES-256-GCM. The stored layout is
//! `version (1) | nonce (12) | ciphertext + tag`, and the associated data binds
//! each ciphertext to the integration row it was written for, so a token
//! copied onto another row fails to open.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

const VERSION_AES_GCM_V1: u8 = 0x01;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 1 + NONCE_LEN;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("unsupported ciphertext version {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("ciphertext too short")]
    Truncated,
}

/// 256-bit key wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CryptoKey(Vec<u8>);

impl CryptoKey {
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        Ok(Self(bytes))
    }

    /// Random key for dev profiles; anything sealed with it dies with the process.
    pub fn ephemeral() -> Self {
        let mut bytes = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl std::fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CryptoKey([REDACTED])")
    }
}

pub fn seal(key: &CryptoKey, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = key
        .cipher()
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut sealed = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    sealed.push(VERSION_AES_GCM_V1);
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

pub fn open(key: &CryptoKey, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (&version, rest) = sealed.split_first().ok_or(CryptoError::Truncated)?;
    if version != VERSION_AES_GCM_V1 {
        return Err(CryptoError::UnsupportedVersion(version));
    }
    if rest.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Truncated);
    }
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
    key.cipher()
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

pub fn seal_token(key: &CryptoKey, aad: &str, token: &str) -> Result<Vec<u8>, CryptoError> {
    seal(key, aad.as_bytes(), token.as_bytes())
}

pub fn open_token(key: &CryptoKey, aad: &str, sealed: &[u8]) -> Result<String, CryptoError> {
    let bytes = open(key, aad.as_bytes(), sealed)?;
    String::from_utf8(bytes).map_err(|e| CryptoError::DecryptionFailed(format!("invalid UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CryptoKey {
        CryptoKey::new(vec![9u8; 32]).unwrap()
    }

    #[test]
    fn sealed_token_opens_with_same_row_binding() {
        let key = key();
        let sealed = seal_token(&key, "t|meta|act_1", "EAAB-token").unwrap();
        assert_eq!(sealed[0], VERSION_AES_GCM_V1);
        assert_eq!(open_token(&key, "t|meta|act_1", &sealed).unwrap(), "EAAB-token");
    }

    #[test]
    fn token_moved_to_another_row_fails_to_open() {
        let key = key();
        let sealed = seal_token(&key, "t|meta|act_1", "EAAB-token").unwrap();
        assert!(open_token(&key, "t|meta|act_2", &sealed).is_err());
    }

    #[test]
    fn tampered_or_truncated_ciphertext_is_rejected() {
        let key = key();
        let mut sealed = seal_token(&key, "aad", "secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            open_token(&key, "aad", &sealed),
            Err(CryptoError::DecryptionFailed(_))
        ));
        assert!(matches!(
            open(&key, b"aad", &[VERSION_AES_GCM_V1, 0, 1]),
            Err(CryptoError::Truncated)
        ));
        assert!(matches!(
            open(&key, b"aad", b"plaintext-token"),
            Err(CryptoError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn key_length_is_enforced() {
        assert!(matches!(
            CryptoKey::new(vec![0u8; 16]),
            Err(CryptoError::InvalidKeyLength(16))
        ));
        assert_eq!(format!("{:?}", key()), "CryptoKey([REDACTED])");
    }
}
