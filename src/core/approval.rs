//! Approval manager: gates every on-chain intent before it reaches a
//! signer.
//!
//! Auto-approval and explicit resolution both reduce to a compare-and-swap
//! against a record's state, the same CAS discipline [`crate::core::kv_store`]
//! documents for task claiming — here the table is owned directly by this
//! component rather than delegated to an external collaborator, since the
//! daily cap accounting has to be single-owner per the runtime's
//! concurrency model.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::core::external::NotificationChannel;
use crate::core::thought_log::ThoughtLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Expired,
    Executed,
}

#[derive(Debug, Clone)]
pub enum ApprovalError {
    Expired,
    Rejected,
    AutoRejectedOverCap,
    NotFound,
    AlreadyResolved,
}

impl fmt::Display for ApprovalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalError::Expired => write!(f, "expired"),
            ApprovalError::Rejected => write!(f, "rejected"),
            ApprovalError::AutoRejectedOverCap => write!(f, "auto_rejected_over_cap"),
            ApprovalError::NotFound => write!(f, "approval record not found"),
            ApprovalError::AlreadyResolved => write!(f, "approval record already resolved"),
        }
    }
}

impl Error for ApprovalError {}

/// The intent an approval record gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub operation: String,
    pub to: String,
    pub value: u64,
    pub data: Vec<u8>,
    pub chain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: Uuid,
    pub intent: Intent,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: ApprovalState,
    pub resolution_source: Option<String>,
}

/// Policy configuration: the contract whitelist and the auto-approve caps.
pub struct ApprovalPolicy {
    pub contract_whitelist: Vec<String>,
    pub auto_cap_per_tx: u64,
    pub auto_cap_per_day: u64,
    pub ttl: std::time::Duration,
}

struct DailyCounter {
    date: NaiveDate,
    total: u64,
}

pub struct ApprovalManager {
    records: RwLock<HashMap<Uuid, ApprovalRecord>>,
    daily: RwLock<DailyCounter>,
    policy: ApprovalPolicy,
    notifier: Arc<dyn NotificationChannel>,
    audit: Mutex<ThoughtLog>,
}

impl ApprovalManager {
    pub fn new(policy: ApprovalPolicy, notifier: Arc<dyn NotificationChannel>, audit: ThoughtLog) -> Self {
        ApprovalManager {
            records: RwLock::new(HashMap::new()),
            daily: RwLock::new(DailyCounter { date: Utc::now().date_naive(), total: 0 }),
            policy,
            notifier,
            audit: Mutex::new(audit),
        }
    }

    fn digest(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())[..16].to_string()
    }

    /// Submit an intent. Returns an approval id in either case; the caller
    /// must call [`ApprovalManager::wait_resolution`] unless the id was
    /// resolved synchronously (auto-approved).
    pub async fn submit(&self, intent: Intent) -> Result<Uuid, Box<dyn Error + Send + Sync>> {
        let now = Utc::now();
        let today = now.date_naive();

        let whitelisted = self.policy.contract_whitelist.iter().any(|c| c == &intent.to);
        let under_tx_cap = intent.value <= self.policy.auto_cap_per_tx;

        if whitelisted && under_tx_cap {
            let mut daily = self.daily.write().await;
            if daily.date != today {
                daily.date = today;
                daily.total = 0;
            }
            if daily.total + intent.value <= self.policy.auto_cap_per_day {
                daily.total += intent.value;
                drop(daily);

                let id = Uuid::new_v4();
                let record = ApprovalRecord {
                    id,
                    intent,
                    created_at: now,
                    expires_at: now,
                    state: ApprovalState::Approved,
                    resolution_source: Some("auto".to_string()),
                };
                self.records.write().await.insert(id, record);
                self.audit
                    .lock()
                    .await
                    .append("approval_manager", "auto_approved", &id.to_string())
                    .ok();
                return Ok(id);
            }
        }

        let id = Uuid::new_v4();
        let expires_at = now + chrono::Duration::from_std(self.policy.ttl).unwrap_or(chrono::Duration::seconds(600));
        let digest = Self::digest(&intent.data);
        let record = ApprovalRecord {
            id,
            intent: intent.clone(),
            created_at: now,
            expires_at,
            state: ApprovalState::Pending,
            resolution_source: None,
        };
        self.records.write().await.insert(id, record);

        self.notifier
            .notify_approval_requested(
                &id.to_string(),
                &intent.operation,
                &intent.to,
                intent.value,
                &digest,
                self.policy.ttl.as_secs(),
            )
            .await?;

        Ok(id)
    }

    /// Explicit human decision. CAS-resolved against the current state so
    /// that approve/reject and the expiry sweep race cleanly.
    pub async fn resolve(&self, id: Uuid, approve: bool) -> Result<(), ApprovalError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(ApprovalError::NotFound)?;
        if record.state != ApprovalState::Pending {
            return Err(ApprovalError::AlreadyResolved);
        }
        record.state = if approve { ApprovalState::Approved } else { ApprovalState::Rejected };
        record.resolution_source = Some("human".to_string());
        let kind = if approve { "approved" } else { "rejected" };
        self.audit.lock().await.append("approval_manager", kind, &id.to_string()).ok();
        Ok(())
    }

    /// Mark an approved record executed, e.g. after the caller submits the
    /// signed transaction.
    pub async fn mark_executed(&self, id: Uuid) -> Result<(), ApprovalError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(ApprovalError::NotFound)?;
        if record.state != ApprovalState::Approved {
            return Err(ApprovalError::AlreadyResolved);
        }
        record.state = ApprovalState::Executed;
        Ok(())
    }

    pub async fn state_of(&self, id: Uuid) -> Option<ApprovalState> {
        self.records.read().await.get(&id).map(|r| r.state)
    }

    /// Periodic sweep: transition every pending record whose expiry has
    /// passed to `expired`. Intended to run every 60s on a
    /// `tokio::time::interval`.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut records = self.records.write().await;
        let mut count = 0;
        for record in records.values_mut() {
            if record.state == ApprovalState::Pending && record.expires_at <= now {
                record.state = ApprovalState::Expired;
                count += 1;
            }
        }
        if count > 0 {
            self.audit
                .lock()
                .await
                .append("approval_manager", "swept_expired", &count.to_string())
                .ok();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::external::NotificationChannel;
    use tempfile::TempDir;

    struct NoopNotifier;
    #[async_trait::async_trait]
    impl NotificationChannel for NoopNotifier {
        async fn notify_approval_requested(
            &self,
            _approval_id: &str,
            _operation: &str,
            _to: &str,
            _value: u64,
            _data_digest: &str,
            _ttl_remaining_secs: u64,
        ) -> Result<(), Box<dyn Error + Send + Sync>> {
            Ok(())
        }
    }

    fn manager(tx_cap: u64, day_cap: u64, ttl_secs: u64, dir: &TempDir) -> ApprovalManager {
        let audit = ThoughtLog::open(&dir.path().to_path_buf(), "approvals").unwrap();
        ApprovalManager::new(
            ApprovalPolicy {
                contract_whitelist: vec!["0xSAFE".to_string()],
                auto_cap_per_tx: tx_cap,
                auto_cap_per_day: day_cap,
                ttl: std::time::Duration::from_secs(ttl_secs),
            },
            Arc::new(NoopNotifier),
            audit,
        )
    }

    fn intent(to: &str, value: u64) -> Intent {
        Intent { operation: "transfer".to_string(), to: to.to_string(), value, data: vec![], chain: "test".to_string() }
    }

    #[tokio::test]
    async fn auto_approves_whitelisted_small_value() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(100, 1000, 600, &dir);
        let id = mgr.submit(intent("0xSAFE", 10)).await.unwrap();
        assert_eq!(mgr.state_of(id).await, Some(ApprovalState::Approved));
    }

    #[tokio::test]
    async fn requires_human_approval_outside_whitelist() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(100, 1000, 600, &dir);
        let id = mgr.submit(intent("0xOTHER", 10)).await.unwrap();
        assert_eq!(mgr.state_of(id).await, Some(ApprovalState::Pending));
    }

    #[tokio::test]
    async fn resolve_is_cas_exclusive() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(100, 1000, 600, &dir);
        let id = mgr.submit(intent("0xOTHER", 10)).await.unwrap();
        mgr.resolve(id, true).await.unwrap();
        let second = mgr.resolve(id, false).await;
        assert!(matches!(second, Err(ApprovalError::AlreadyResolved)));
        assert_eq!(mgr.state_of(id).await, Some(ApprovalState::Approved));
    }

    #[tokio::test]
    async fn sweep_expires_overdue_pending_records() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(100, 1000, 0, &dir);
        let id = mgr.submit(intent("0xOTHER", 10)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let swept = mgr.sweep_expired().await;
        assert_eq!(swept, 1);
        assert_eq!(mgr.state_of(id).await, Some(ApprovalState::Expired));
    }

    #[tokio::test]
    async fn daily_cap_exhaustion_falls_back_to_pending() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(100, 50, 600, &dir);
        let first = mgr.submit(intent("0xSAFE", 40)).await.unwrap();
        assert_eq!(mgr.state_of(first).await, Some(ApprovalState::Approved));
        let second = mgr.submit(intent("0xSAFE", 40)).await.unwrap();
        assert_eq!(mgr.state_of(second).await, Some(ApprovalState::Pending));
    }
}
