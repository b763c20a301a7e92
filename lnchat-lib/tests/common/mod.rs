//! Common test utilities for lnchat-lib integration tests

use async_trait::async_trait;
use lnchat_lib::{Address, Result, Signer, Verifier};
use sha2::{Digest, Sha256};

/// Address whose first byte is `tag` and the rest zero.
#[allow(dead_code)]
pub fn addr(tag: u8) -> Address {
    let mut raw = [0u8; 33];
    raw[0] = tag;
    Address::new(raw)
}

fn tag(key: &Address, data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Keyed-hash signer standing in for a node key.
#[allow(dead_code)]
pub struct HashSigner(pub Address);

#[async_trait]
impl Signer for HashSigner {
    fn address(&self) -> Address {
        self.0
    }

    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(tag(&self.0, data))
    }
}

/// Checks [`HashSigner`] signatures for a local address.
#[allow(dead_code)]
pub struct HashVerifier(pub Address);

#[async_trait]
impl Verifier for HashVerifier {
    fn address(&self) -> Address {
        self.0
    }

    async fn verify(&self, data: &[u8], sig: &[u8], sender: &Address) -> Result<bool> {
        Ok(tag(sender, data) == sig)
    }
}
