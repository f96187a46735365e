//! Minimal collaborator traits for leaves that are explicitly out of core
//! scope: protocol-specific social/chain clients, market data, on-chain
//! skill registries, and human notification channels. The core depends only
//! on these trait objects; concrete implementations (a Twitter client, an
//! RPC node client, a price feed) live outside this crate.

use std::error::Error;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Publishes content to whatever social surface the embedding application
/// wires up. The core's agentic loop and `post` method call this without
/// knowing which platform is behind it.
#[async_trait]
pub trait SocialClient: Send + Sync {
    async fn post(&self, content: &str) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// On-chain interactions the core needs from a specific chain client:
/// sending a transaction and reading a balance. Anything chain-specific
/// (gas estimation, ABI encoding) stays behind this trait.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn send_transaction(
        &self,
        to: &str,
        value: u64,
        data: &[u8],
    ) -> Result<String, Box<dyn Error + Send + Sync>>;

    async fn balance_of(&self, address: &str) -> Result<u64, Box<dyn Error + Send + Sync>>;
}

/// Read-only market data lookups backing `defi`/`research` handlers.
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn price(&self, token: &str) -> Result<f64, Box<dyn Error + Send + Sync>>;
}

/// A single skill record as stored on an external skill registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnChainSkillRecord {
    pub name: String,
    pub description: String,
    pub community_stake: u64,
    pub content_uri: String,
}

/// The on-chain skill lookup the skill registry falls back to. Capped reads
/// (at most `limit` records) keep a misbehaving registry from stalling a
/// search indefinitely.
#[async_trait]
pub trait OnChainSkillSource: Send + Sync {
    async fn list_skills(&self, limit: usize) -> Result<Vec<OnChainSkillRecord>, Box<dyn Error + Send + Sync>>;
}

/// Outbound approval-notification sink. The core never assumes a specific
/// chat platform; it only sends compact summaries and receives decisions.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn notify_approval_requested(
        &self,
        approval_id: &str,
        operation: &str,
        to: &str,
        value: u64,
        data_digest: &str,
        ttl_remaining_secs: u64,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}
