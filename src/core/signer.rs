//! Signer abstraction fronting the secrets broker.
//!
//! Mirrors the shape of [`crate::core::client_wrapper::ClientWrapper`]:
//! callers hold an `Arc<dyn Signer>` and never branch on which concrete
//! backend is behind it. [`BrokerSigner`] delegates every call to a
//! [`crate::core::broker::BrokerClient`]; [`LocalSigner`] exists purely for
//! tests and never touches a real key.

use std::error::Error;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::core::broker::BrokerClient;

/// Provider-agnostic signing surface. No implementation may expose the raw
/// key material backing it — only signatures and the derived address.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>>;
    async fn sign_typed_data(&self, payload: &serde_json::Value) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>>;
    async fn get_address(&self) -> Result<String, Box<dyn Error + Send + Sync>>;
}

/// The production signer: every operation proxies to the secrets broker
/// over its IPC channel, so the key material never enters this process.
pub struct BrokerSigner {
    broker: BrokerClient,
    address_cache: OnceCell<String>,
}

impl BrokerSigner {
    pub fn new(broker: BrokerClient) -> Self {
        BrokerSigner {
            broker,
            address_cache: OnceCell::new(),
        }
    }
}

#[async_trait]
impl Signer for BrokerSigner {
    async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
        self.broker.sign_message(message).await
    }

    async fn sign_typed_data(&self, payload: &serde_json::Value) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
        self.broker.sign_typed_data(payload).await
    }

    async fn get_address(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        if let Some(addr) = self.address_cache.get() {
            return Ok(addr.clone());
        }
        let addr = self.broker.get_address().await?;
        let _ = self.address_cache.set(addr.clone());
        Ok(addr)
    }
}

/// Deterministic, insecure signer used in tests. Never construct this
/// outside `#[cfg(test)]` code.
pub struct LocalSigner {
    address: String,
}

impl LocalSigner {
    pub fn new(address: impl Into<String>) -> Self {
        LocalSigner { address: address.into() }
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(message);
        Ok(hasher.finalize().to_vec())
    }

    async fn sign_typed_data(&self, payload: &serde_json::Value) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
        self.sign_message(payload.to_string().as_bytes()).await
    }

    async fn get_address(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok(self.address.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_signer_returns_deterministic_signature() {
        let signer = LocalSigner::new("0xabc");
        let sig1 = signer.sign_message(b"hello").await.unwrap();
        let sig2 = signer.sign_message(b"hello").await.unwrap();
        assert_eq!(sig1, sig2);
        assert_eq!(signer.get_address().await.unwrap(), "0xabc");
    }
}
