//! Task queue poller: pulls pending tasks from the shared [`KvStore`] on a
//! fixed cadence, claims them via compare-and-swap, executes them against a
//! closed set of task types, and writes results back with a retention TTL.
//!
//! The pending list lives at key `tasks:pending` (a JSON array of task
//! ids); each task's record lives at `task:<id>`. Claiming a task is the
//! same CAS-against-last-read-value discipline [`crate::core::kv_store`]
//! documents, reused here instead of a bespoke locking scheme.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::kv_store::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum TaskType {
    DefiQuery,
    ContractDeploy,
    TokenResearch,
    ContentGenerate,
    ScamCheck,
}

impl TaskType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "defi-query" => Some(TaskType::DefiQuery),
            "contract-deploy" => Some(TaskType::ContractDeploy),
            "token-research" => Some(TaskType::TokenResearch),
            "content-generate" => Some(TaskType::ContentGenerate),
            "scam-check" => Some(TaskType::ScamCheck),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Claimed,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub state: TaskState,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum PollerError {
    Kv(String),
    Malformed(String),
}

impl fmt::Display for PollerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollerError::Kv(m) => write!(f, "queue store error: {}", m),
            PollerError::Malformed(m) => write!(f, "malformed task record: {}", m),
        }
    }
}

impl Error for PollerError {}

/// One handler per closed task type. Handlers never see tasks of a type
/// they weren't registered for.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, payload: serde_json::Value) -> Result<serde_json::Value, String>;
}

const PENDING_KEY: &str = "tasks:pending";

fn task_key(id: &str) -> String {
    format!("task:{}", id)
}

/// Owns the poll loop's single-flight guard and the handler registry.
pub struct QueuePoller {
    store: Arc<dyn KvStore>,
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
    batch_size: usize,
    completed_retention: Duration,
    polling: AtomicBool,
}

impl QueuePoller {
    pub fn new(store: Arc<dyn KvStore>, batch_size: usize, completed_retention: Duration) -> Self {
        QueuePoller {
            store,
            handlers: HashMap::new(),
            batch_size,
            completed_retention,
            polling: AtomicBool::new(false),
        }
    }

    pub fn register(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type, handler);
    }

    async fn pending_ids(&self) -> Result<Vec<String>, PollerError> {
        match self.store.get(PENDING_KEY).await.map_err(|e| PollerError::Kv(e.to_string()))? {
            Some(json) => serde_json::from_str(&json).map_err(|e| PollerError::Malformed(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn remove_from_pending(&self, id: &str) -> Result<(), PollerError> {
        let current = self
            .store
            .get(PENDING_KEY)
            .await
            .map_err(|e| PollerError::Kv(e.to_string()))?
            .unwrap_or_else(|| "[]".to_string());
        let mut ids: Vec<String> =
            serde_json::from_str(&current).map_err(|e| PollerError::Malformed(e.to_string()))?;
        ids.retain(|x| x != id);
        let updated = serde_json::to_string(&ids).map_err(|e| PollerError::Malformed(e.to_string()))?;
        self.store
            .compare_and_swap(PENDING_KEY, Some(&current), &updated)
            .await
            .map_err(|e| PollerError::Kv(e.to_string()))?;
        Ok(())
    }

    /// Run a single poll cycle: pull up to `batch_size` pending task ids,
    /// claim each one (CAS its state from `pending` to `claimed`), and
    /// execute whatever was successfully claimed. A single-flight guard
    /// makes overlapping calls to `poll_once` a no-op rather than a second
    /// concurrent pass over the same batch.
    pub async fn poll_once(&self) -> Result<usize, PollerError> {
        if self.polling.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        let result = self.poll_once_inner().await;
        self.polling.store(false, Ordering::SeqCst);
        result
    }

    async fn poll_once_inner(&self) -> Result<usize, PollerError> {
        let ids = self.pending_ids().await?;
        let mut processed = 0;

        for id in ids.into_iter().take(self.batch_size) {
            let key = task_key(&id);
            let raw = match self.store.get(&key).await.map_err(|e| PollerError::Kv(e.to_string()))? {
                Some(r) => r,
                None => {
                    self.remove_from_pending(&id).await?;
                    continue;
                }
            };
            let mut record: TaskRecord =
                serde_json::from_str(&raw).map_err(|e| PollerError::Malformed(e.to_string()))?;

            if record.state != TaskState::Pending {
                self.remove_from_pending(&id).await?;
                continue;
            }

            let claimed_raw = serde_json::to_string(&TaskRecord { state: TaskState::Claimed, ..record.clone() })
                .map_err(|e| PollerError::Malformed(e.to_string()))?;
            let claimed = self
                .store
                .compare_and_swap(&key, Some(&raw), &claimed_raw)
                .await
                .map_err(|e| PollerError::Kv(e.to_string()))?;
            if !claimed {
                continue;
            }

            record.state = TaskState::Claimed;
            self.execute_claimed(&key, record).await?;
            self.remove_from_pending(&id).await?;
            processed += 1;
        }

        Ok(processed)
    }

    async fn execute_claimed(&self, key: &str, mut record: TaskRecord) -> Result<(), PollerError> {
        let task_type = match TaskType::parse(&record.task_type) {
            Some(t) => t,
            None => {
                record.state = TaskState::Failed;
                record.result = Some(serde_json::json!({ "error": "unknown_task_type" }));
                record.completed_at = Some(Utc::now());
                return self.write_back(key, &record).await;
            }
        };

        record.state = TaskState::Processing;
        self.write_back(key, &record).await?;

        match self.handlers.get(&task_type) {
            Some(handler) => match handler.execute(record.payload.clone()).await {
                Ok(result) => {
                    record.state = TaskState::Completed;
                    record.result = Some(result);
                }
                Err(message) => {
                    record.state = TaskState::Failed;
                    record.result = Some(serde_json::json!({ "error": message }));
                }
            },
            None => {
                record.state = TaskState::Failed;
                record.result = Some(serde_json::json!({ "error": "no_handler_registered" }));
            }
        }
        record.completed_at = Some(Utc::now());
        self.write_back(key, &record).await
    }

    async fn write_back(&self, key: &str, record: &TaskRecord) -> Result<(), PollerError> {
        let json = serde_json::to_string(record).map_err(|e| PollerError::Malformed(e.to_string()))?;
        let ttl = match record.state {
            TaskState::Completed | TaskState::Failed => Some(self.completed_retention),
            _ => None,
        };
        self.store.set(key, &json, ttl).await.map_err(|e| PollerError::Kv(e.to_string()))
    }

    /// Enqueue a new task in `pending` state.
    pub async fn submit(&self, id: &str, task_type: &str, payload: serde_json::Value) -> Result<(), PollerError> {
        let record = TaskRecord {
            id: id.to_string(),
            task_type: task_type.to_string(),
            payload,
            state: TaskState::Pending,
            result: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let json = serde_json::to_string(&record).map_err(|e| PollerError::Malformed(e.to_string()))?;
        self.store.set(&task_key(id), &json, None).await.map_err(|e| PollerError::Kv(e.to_string()))?;

        let current = self.pending_ids().await.unwrap_or_default();
        let current_json = serde_json::to_string(&current).unwrap_or_else(|_| "[]".to_string());
        let mut updated = current;
        updated.push(id.to_string());
        let updated_json = serde_json::to_string(&updated).map_err(|e| PollerError::Malformed(e.to_string()))?;
        self.store
            .compare_and_swap(PENDING_KEY, Some(&current_json), &updated_json)
            .await
            .map_err(|e| PollerError::Kv(e.to_string()))?;
        Ok(())
    }

    pub async fn state_of(&self, id: &str) -> Result<Option<TaskState>, PollerError> {
        match self.store.get(&task_key(id)).await.map_err(|e| PollerError::Kv(e.to_string()))? {
            Some(raw) => {
                let record: TaskRecord =
                    serde_json::from_str(&raw).map_err(|e| PollerError::Malformed(e.to_string()))?;
                Ok(Some(record.state))
            }
            None => Ok(None),
        }
    }
}
