//! Skill registry: finds and loads a named capability through a fixed
//! search order — local semantic search over cached embeddings, keyword
//! fallback, on-chain registry, remote HTTP — stopping at the first stage
//! that produces a match.
//!
//! Remote lookups never bypass [`crate::core::network_safety::NetworkSafety`];
//! a skill fetched from a URL is subject to the exact same SSRF and
//! rate-limit rules as any other outbound call this runtime makes.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::broker::BrokerClient;
use crate::core::external::OnChainSkillSource;
use crate::core::network_safety::{FetchOptions, NetworkSafety};

/// Similarity floor a cached embedding must clear to count as a semantic
/// match. Below this, stage 1 is treated as a miss and the search falls
/// through to keyword matching.
const SEMANTIC_MATCH_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillEntry {
    pub name: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillSource {
    Semantic,
    Keyword,
    OnChain,
    Remote,
}

#[derive(Debug, Clone)]
pub enum SkillError {
    NotFound(String),
    RemoteRejected(String),
}

impl fmt::Display for SkillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkillError::NotFound(name) => write!(f, "skill_not_found: {}", name),
            SkillError::RemoteRejected(reason) => write!(f, "remote fetch rejected: {}", reason),
        }
    }
}

impl Error for SkillError {}

pub struct SkillMatch {
    pub entry: SkillEntry,
    pub source: SkillSource,
}

/// Layered skill lookup. The local index is the registry's own mutable
/// state (`install`); the remaining three stages delegate to collaborators
/// this registry never mutates.
///
/// `embedder` is the optional embedding provider behind stage 1. Its
/// absence (spec: "if an embedding provider is available") means the
/// semantic stage is silently skipped, not an error — the search simply
/// starts at keyword matching.
pub struct SkillRegistry {
    local: RwLock<HashMap<String, SkillEntry>>,
    embeddings: RwLock<HashMap<String, Vec<f32>>>,
    embedder: Option<Arc<BrokerClient>>,
    on_chain: Arc<dyn OnChainSkillSource>,
    network: Arc<NetworkSafety>,
    on_chain_limit: usize,
}

impl SkillRegistry {
    pub fn new(
        embedder: Option<Arc<BrokerClient>>,
        on_chain: Arc<dyn OnChainSkillSource>,
        network: Arc<NetworkSafety>,
        on_chain_limit: usize,
    ) -> Self {
        SkillRegistry {
            local: RwLock::new(HashMap::new()),
            embeddings: RwLock::new(HashMap::new()),
            embedder,
            on_chain,
            network,
            on_chain_limit,
        }
    }

    /// Install (or overwrite) a skill directly in the local index. If an
    /// embedding provider is configured, its embedding is computed and
    /// cached for stage 1; a failed or unavailable embed just leaves this
    /// entry out of the semantic stage, it still matches via keyword.
    pub async fn install(&self, entry: SkillEntry) {
        if let Some(embedder) = &self.embedder {
            let text = format!("{} {}", entry.name, entry.description);
            match embedder.embed(&text).await {
                Ok(vector) => {
                    self.embeddings.write().await.insert(entry.name.clone(), vector);
                }
                Err(e) => log::warn!("skills: embedding '{}' failed, semantic stage will skip it: {}", entry.name, e),
            }
        }
        self.local.write().await.insert(entry.name.clone(), entry);
    }

    pub async fn installed_count(&self) -> usize {
        self.local.read().await.len()
    }

    /// Stage 1: embed `query` and rank cached embeddings by cosine
    /// similarity, returning the best match if it clears
    /// [`SEMANTIC_MATCH_THRESHOLD`]. Skipped entirely without an embedder.
    async fn find_semantic(&self, query: &str) -> Option<SkillEntry> {
        let embedder = self.embedder.as_ref()?;
        let query_vector = embedder.embed(query).await.ok()?;

        let best_name = {
            let embeddings = self.embeddings.read().await;
            embeddings
                .iter()
                .map(|(name, vector)| (name.clone(), cosine_similarity(&query_vector, vector)))
                .filter(|(_, score)| *score >= SEMANTIC_MATCH_THRESHOLD)
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(name, _)| name)
        }?;

        self.local.read().await.get(&best_name).cloned()
    }

    /// Stage 2: keyword containment against every locally installed skill.
    /// Case-insensitive substring match against each skill's keyword list.
    async fn find_by_keyword(&self, query: &str) -> Option<SkillEntry> {
        let needle = query.to_ascii_lowercase();
        let local = self.local.read().await;
        local
            .values()
            .find(|entry| entry.keywords.iter().any(|k| k.to_ascii_lowercase().contains(&needle)))
            .cloned()
    }

    /// Stage 3: on-chain registry lookup, capped at `on_chain_limit` records
    /// so a misbehaving registry cannot stall the search indefinitely.
    async fn find_on_chain(&self, query: &str) -> Option<SkillEntry> {
        let records = self.on_chain.list_skills(self.on_chain_limit).await.ok()?;
        records
            .into_iter()
            .find(|r| r.name == query)
            .map(|r| SkillEntry {
                name: r.name,
                description: r.description,
                keywords: vec![],
                content: r.content_uri,
            })
    }

    /// Stage 4: fetch `query` as a URL through the runtime's SSRF-safe
    /// fetch path. Only reached if every earlier stage misses.
    async fn find_remote(&self, query: &str) -> Result<Option<SkillEntry>, SkillError> {
        if !(query.starts_with("http://") || query.starts_with("https://")) {
            return Ok(None);
        }
        let outcome = self.network.safe_fetch(query, &FetchOptions::default()).await;
        if !outcome.safe {
            return Err(SkillError::RemoteRejected(
                outcome.reason.map(|r| r.to_string()).unwrap_or_else(|| "unknown".to_string()),
            ));
        }
        Ok(outcome.content.map(|content| SkillEntry {
            name: query.to_string(),
            description: "fetched remote skill".to_string(),
            keywords: vec![],
            content,
        }))
    }

    /// Run the full search order, stopping at the first stage that matches.
    /// A remote-fetch rejection only surfaces as an error when no earlier
    /// stage produced a match.
    pub async fn find_and_load(&self, query: &str) -> Result<SkillMatch, SkillError> {
        if let Some(entry) = self.find_semantic(query).await {
            return Ok(SkillMatch { entry, source: SkillSource::Semantic });
        }
        if let Some(entry) = self.find_by_keyword(query).await {
            return Ok(SkillMatch { entry, source: SkillSource::Keyword });
        }
        if let Some(entry) = self.find_on_chain(query).await {
            return Ok(SkillMatch { entry, source: SkillSource::OnChain });
        }
        match self.find_remote(query).await {
            Ok(Some(entry)) => Ok(SkillMatch { entry, source: SkillSource::Remote }),
            Ok(None) => Err(SkillError::NotFound(query.to_string())),
            Err(e) => Err(e),
        }
    }
}

/// Cosine similarity between two equal-length vectors. Returns `-1.0` (the
/// lowest possible score, never a false match) if either vector is zero or
/// the lengths differ, rather than dividing by zero.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return -1.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return -1.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::external::OnChainSkillRecord;
    use async_trait::async_trait;
    use std::time::Duration;

    struct EmptyOnChain;
    #[async_trait]
    impl OnChainSkillSource for EmptyOnChain {
        async fn list_skills(&self, _limit: usize) -> Result<Vec<OnChainSkillRecord>, Box<dyn Error + Send + Sync>> {
            Ok(vec![])
        }
    }

    struct SingleSkillOnChain;
    #[async_trait]
    impl OnChainSkillSource for SingleSkillOnChain {
        async fn list_skills(&self, _limit: usize) -> Result<Vec<OnChainSkillRecord>, Box<dyn Error + Send + Sync>> {
            Ok(vec![OnChainSkillRecord {
                name: "oracle_lookup".to_string(),
                description: "reads an oracle price feed".to_string(),
                community_stake: 10,
                content_uri: "ipfs://placeholder".to_string(),
            }])
        }
    }

    fn registry(on_chain: Arc<dyn OnChainSkillSource>) -> SkillRegistry {
        SkillRegistry::new(None, on_chain, Arc::new(NetworkSafety::new(10.0, Duration::from_secs(60))), 50)
    }

    #[tokio::test]
    async fn semantic_stage_is_skipped_without_an_embedder_and_falls_through_to_on_chain() {
        // With no embedder configured, a locally installed entry whose
        // keywords don't match the query is invisible to stages 1-2, so a
        // same-named on-chain record wins instead.
        let reg = registry(Arc::new(SingleSkillOnChain));
        reg.install(SkillEntry {
            name: "oracle_lookup".to_string(),
            description: "local version".to_string(),
            keywords: vec!["price".to_string()],
            content: "local content".to_string(),
        })
        .await;

        let result = reg.find_and_load("oracle_lookup").await.unwrap();
        assert_eq!(result.source, SkillSource::OnChain);
    }

    #[tokio::test]
    async fn keyword_fallback_matches_when_name_misses() {
        let reg = registry(Arc::new(EmptyOnChain));
        reg.install(SkillEntry {
            name: "swap_helper".to_string(),
            description: "".to_string(),
            keywords: vec!["defi-swap".to_string()],
            content: "c".to_string(),
        })
        .await;

        let result = reg.find_and_load("defi-swap").await.unwrap();
        assert_eq!(result.source, SkillSource::Keyword);
    }

    #[tokio::test]
    async fn falls_through_to_on_chain_when_local_misses() {
        let reg = registry(Arc::new(SingleSkillOnChain));
        let result = reg.find_and_load("oracle_lookup").await.unwrap();
        assert_eq!(result.source, SkillSource::OnChain);
    }

    #[tokio::test]
    async fn not_found_when_every_stage_misses() {
        let reg = registry(Arc::new(EmptyOnChain));
        let result = reg.find_and_load("nonexistent").await;
        assert!(matches!(result, Err(SkillError::NotFound(_))));
    }

    #[tokio::test]
    async fn non_url_query_never_reaches_remote_stage() {
        let reg = registry(Arc::new(EmptyOnChain));
        let result = reg.find_and_load("just a plain phrase").await;
        assert!(matches!(result, Err(SkillError::NotFound(_))));
    }

    #[test]
    fn cosine_similarity_of_identical_vectors_is_one() {
        let v = vec![0.3, 0.1, 0.9];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_of_orthogonal_vectors_is_zero() {
        assert!((cosine_similarity(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_of_opposite_vectors_is_negative_one() {
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_rejects_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), -1.0);
    }
}
