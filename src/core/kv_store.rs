//! Key/value collaborator used for queue storage, approval bookkeeping, and
//! nonce dedup.
//!
//! The core only ever needs `get`/`set`/`delete` plus a single
//! compare-and-swap primitive ([`KvStore::compare_and_swap`]) — task claim,
//! approval resolution, and nonce marking all reduce to "change this value
//! only if it still equals what I last read". [`InMemoryKvStore`] is the
//! default; [`JsonlKvStore`] persists to a newline-delimited JSON file using
//! the same append-and-reload idiom as [`crate::core::thought_log`].

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub enum KvError {
    Io(String),
    Serde(String),
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvError::Io(msg) => write!(f, "kv_store io error: {}", msg),
            KvError::Serde(msg) => write!(f, "kv_store serialization error: {}", msg),
        }
    }
}

impl Error for KvError {}

#[derive(Clone, Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// Minimal async key/value contract shared by the queue poller, the
/// approval manager, and any nonce-dedup caller.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Atomically replace `key`'s value with `new` only if its current value
    /// equals `expected`. Returns `true` if the swap happened. A key with no
    /// current value only swaps when `expected` is `None`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, KvError>;
}

/// Plain in-memory store behind a single `RwLock<HashMap<...>>`, mirroring
/// the registry shape used throughout the teacher's codebase (e.g.
/// `UnifiedMcpServer::tools`). TTL expiry is lazy: checked on `get`, not
/// swept proactively.
pub struct InMemoryKvStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        InMemoryKvStore {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn from_map(map: HashMap<String, Entry>) -> Self {
        InMemoryKvStore {
            entries: RwLock::new(map),
        }
    }

    fn is_live(entry: &Entry) -> bool {
        match entry.expires_at {
            Some(deadline) => Instant::now() < deadline,
            None => true,
        }
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| Self::is_live(e))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, KvError> {
        let mut entries = self.entries.write().await;
        let current = entries.get(key).filter(|e| Self::is_live(e)).map(|e| e.value.as_str());
        if current != expected {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: new.to_string(),
                expires_at: None,
            },
        );
        Ok(true)
    }
}

#[derive(Serialize, Deserialize, Clone)]
struct Record {
    key: String,
    value: Option<String>,
}

/// File-backed store: an in-memory index rebuilt from, and mirrored to, a
/// newline-delimited JSON append log. Deletions append a tombstone record
/// (`value: None`) rather than rewriting the file, the same append-only
/// discipline [`crate::core::thought_log::ThoughtLog`] uses for its chain.
pub struct JsonlKvStore {
    inner: InMemoryKvStore,
    file_path: PathBuf,
}

impl JsonlKvStore {
    pub fn open(path: PathBuf) -> Result<Self, KvError> {
        let mut map: HashMap<String, Entry> = HashMap::new();
        if path.exists() {
            let file = fs::File::open(&path).map_err(|e| KvError::Io(e.to_string()))?;
            let reader = BufReader::new(file);
            for line in reader.lines() {
                let line = line.map_err(|e| KvError::Io(e.to_string()))?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: Record =
                    serde_json::from_str(&line).map_err(|e| KvError::Serde(e.to_string()))?;
                // Replaying the log: later records (including tombstones) win.
                // No TTL survives a restart, matching the "advisory, may
                // under-count briefly at restart" guidance for single-owner state.
                match record.value {
                    Some(v) => {
                        map.insert(record.key, Entry { value: v, expires_at: None });
                    }
                    None => {
                        map.remove(&record.key);
                    }
                }
            }
        }
        Ok(JsonlKvStore {
            inner: InMemoryKvStore::from_map(map),
            file_path: path,
        })
    }

    fn append_record(&self, record: &Record) -> Result<(), KvError> {
        let line = serde_json::to_string(record).map_err(|e| KvError::Serde(e.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .map_err(|e| KvError::Io(e.to_string()))?;
        writeln!(file, "{}", line).map_err(|e| KvError::Io(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for JsonlKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        self.inner.set(key, value, ttl).await?;
        self.append_record(&Record {
            key: key.to_string(),
            value: Some(value.to_string()),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.inner.delete(key).await?;
        self.append_record(&Record {
            key: key.to_string(),
            value: None,
        })
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, KvError> {
        let swapped = self.inner.compare_and_swap(key, expected, new).await?;
        if swapped {
            self.append_record(&Record {
                key: key.to_string(),
                value: Some(new.to_string()),
            })?;
        }
        Ok(swapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn get_set_delete_round_trip() {
        let store = InMemoryKvStore::new();
        store.set("a", "1", None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some("1".to_string()));
        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ttl_expires_lazily_on_read() {
        let store = InMemoryKvStore::new();
        store.set("a", "1", Some(Duration::from_millis(10))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn compare_and_swap_only_succeeds_when_expected_matches() {
        let store = InMemoryKvStore::new();
        store.set("task:1", "pending", None).await.unwrap();

        let first = store.compare_and_swap("task:1", Some("pending"), "processing").await.unwrap();
        assert!(first);

        let second = store.compare_and_swap("task:1", Some("pending"), "processing").await.unwrap();
        assert!(!second);

        assert_eq!(store.get("task:1").await.unwrap(), Some("processing".to_string()));
    }

    #[tokio::test]
    async fn jsonl_store_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv.jsonl");
        {
            let store = JsonlKvStore::open(path.clone()).unwrap();
            store.set("k", "v", None).await.unwrap();
        }
        assert!(path.exists());
    }
}
