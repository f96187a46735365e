//! End-to-end: the daily auto-approve cap is enforced across multiple
//! submissions from a whitelisted counterparty, and the first submission to
//! cross the cap falls back to a pending human-approval record instead of
//! being auto-approved or rejected outright.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use agentcore::core::approval::{ApprovalManager, ApprovalPolicy, ApprovalState, Intent};
use agentcore::core::external::NotificationChannel;
use agentcore::core::thought_log::ThoughtLog;
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

fn intent(value: u64) -> Intent {
    Intent {
        operation: "transfer".to_string(),
        to: "0xWHITELISTED".to_string(),
        value,
        data: vec![],
        chain: "test".to_string(),
    }
}

#[tokio::test]
async fn cap_exhaustion_mid_stream_stops_auto_approval() {
    let dir = TempDir::new().unwrap();
    let audit = ThoughtLog::open(&dir.path().to_path_buf(), "approvals").unwrap();
    let mgr = ApprovalManager::new(
        ApprovalPolicy {
            contract_whitelist: vec!["0xWHITELISTED".to_string()],
            auto_cap_per_tx: 1000,
            auto_cap_per_day: 100,
            ttl: Duration::from_secs(600),
        },
        Arc::new(NoopNotifier),
        audit,
    );

    // 40 + 40 = 80 <= 100, both auto-approve.
    let a = mgr.submit(intent(40)).await.unwrap();
    let b = mgr.submit(intent(40)).await.unwrap();
    assert_eq!(mgr.state_of(a).await, Some(ApprovalState::Approved));
    assert_eq!(mgr.state_of(b).await, Some(ApprovalState::Approved));

    // 80 + 40 = 120 > 100, the third falls back to pending rather than
    // being auto-rejected: a human can still approve it manually.
    let c = mgr.submit(intent(40)).await.unwrap();
    assert_eq!(mgr.state_of(c).await, Some(ApprovalState::Pending));

    mgr.resolve(c, true).await.unwrap();
    assert_eq!(mgr.state_of(c).await, Some(ApprovalState::Approved));
}

#[tokio::test]
async fn single_transaction_over_the_per_tx_cap_never_auto_approves() {
    let dir = TempDir::new().unwrap();
    let audit = ThoughtLog::open(&dir.path().to_path_buf(), "approvals").unwrap();
    let mgr = ApprovalManager::new(
        ApprovalPolicy {
            contract_whitelist: vec!["0xWHITELISTED".to_string()],
            auto_cap_per_tx: 50,
            auto_cap_per_day: 10_000,
            ttl: Duration::from_secs(600),
        },
        Arc::new(NoopNotifier),
        audit,
    );

    let id = mgr.submit(intent(500)).await.unwrap();
    assert_eq!(mgr.state_of(id).await, Some(ApprovalState::Pending));
}
