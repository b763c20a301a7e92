//! Sealing of store snapshots with AES-256-GCM.
//!
//! # Wire Format
//!
//! ```text
//! [1 byte version][12 bytes nonce][N bytes ciphertext][16 bytes auth tag]
//! ```
//!
//! The cipher key is derived with HKDF-SHA256 from a 32-byte master key and
//! a per-purpose label, so the same key file can seal other artifacts later
//! without key reuse.

use std::path::Path;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

const SEAL_VERSION: u8 = 1;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// HKDF label for store snapshots.
pub const SNAPSHOT_LABEL: &[u8] = b"lnchat-store-snapshot-v1";

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("encryption failed: {0}")]
    EncryptFailed(String),
    #[error("decryption failed: {0}")]
    DecryptFailed(String),
    #[error("invalid sealed format")]
    InvalidFormat,
    #[error("unsupported seal version: {0}")]
    UnsupportedVersion(u8),
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

pub type EncryptionResult<T> = Result<T, EncryptionError>;

/// Authenticated cipher bound to one purpose label.
pub struct SealingKey {
    cipher: Aes256Gcm,
}

impl SealingKey {
    pub fn derive(master_key: &[u8; 32], label: &[u8]) -> EncryptionResult<Self> {
        let hk = Hkdf::<Sha256>::new(None, master_key);
        let mut key = Zeroizing::new([0u8; 32]);
        hk.expand(label, key.as_mut())
            .map_err(|e| EncryptionError::InvalidKey(e.to_string()))?;
        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| EncryptionError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, plaintext: &[u8]) -> EncryptionResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| EncryptionError::EncryptFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
        out.push(SEAL_VERSION);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, sealed: &[u8]) -> EncryptionResult<Vec<u8>> {
        if sealed.len() < 1 + NONCE_SIZE + TAG_SIZE {
            return Err(EncryptionError::InvalidFormat);
        }
        if sealed[0] != SEAL_VERSION {
            return Err(EncryptionError::UnsupportedVersion(sealed[0]));
        }
        let (nonce, ciphertext) = sealed[1..].split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| EncryptionError::DecryptFailed("authentication failed".to_string()))
    }
}

/// Read a 32-byte master key stored raw or as 64 hex characters.
///
/// Every intermediate buffer holding key material is wiped on drop.
pub fn load_key_file(path: impl AsRef<Path>) -> EncryptionResult<Zeroizing<[u8; 32]>> {
    let path = path.as_ref();
    let raw = Zeroizing::new(
        std::fs::read(path)
            .map_err(|e| EncryptionError::InvalidKey(format!("{}: {}", path.display(), e)))?,
    );
    let decoded;
    let bytes: &[u8] = if raw.len() == 32 {
        &raw
    } else {
        let text = Zeroizing::new(String::from_utf8_lossy(&raw).into_owned());
        decoded = Zeroizing::new(
            hex::decode(text.trim())
                .map_err(|e| EncryptionError::InvalidKey(format!("{}: {}", path.display(), e)))?,
        );
        &decoded
    };
    if bytes.len() != 32 {
        return Err(EncryptionError::InvalidKey(format!(
            "expected 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(bytes);
    Ok(key)
}

/// Fresh random master key.
pub fn generate_key() -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    rand::thread_rng().fill_bytes(key.as_mut());
    key
}
