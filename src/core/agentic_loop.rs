//! Agentic loop: the runtime's own heartbeat.
//!
//! On a fixed cadence (default 60s) the loop runs one tick through a fixed
//! sequence of housekeeping steps — sweep expired approvals, reap exited
//! sub-agents, poll the task queue once, run any registered periodic
//! behaviors, then publish a heartbeat event. A step that errors is logged
//! and skipped; a tick never retries a step before moving to the next one.
//! `start`, `stop`, and `set_thinking_level` are the only operations a
//! caller may drive from outside a tick.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::core::approval::ApprovalManager;
use crate::core::bus::{EventBus, Topic};
use crate::core::queue_poller::QueuePoller;
use crate::core::supervisor::Supervisor;
use crate::core::thinking::ThinkingLevel;

/// One piece of work the loop runs every tick, beyond its fixed
/// housekeeping steps. A failing behavior never aborts the tick; its error
/// is logged and the next behavior (or step) still runs.
#[async_trait]
pub trait PeriodicBehavior: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>>;
}

struct TickOutcome {
    approvals_swept: usize,
    agents_reaped: usize,
    agents_expired: usize,
    tasks_processed: usize,
    behaviors_run: usize,
    behaviors_failed: usize,
}

/// Coordinates the periodic housekeeping pass across the approval manager,
/// sub-agent supervisor, and task queue poller.
pub struct AgenticLoop {
    tick_interval: Duration,
    subagent_exited_retention: Duration,
    approvals: Arc<ApprovalManager>,
    queue: Arc<QueuePoller>,
    supervisor: Arc<Supervisor>,
    bus: Arc<EventBus>,
    behaviors: Vec<Arc<dyn PeriodicBehavior>>,
    thinking_tx: watch::Sender<ThinkingLevel>,
    thinking_rx: watch::Receiver<ThinkingLevel>,
    running: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl AgenticLoop {
    pub fn new(
        tick_interval: Duration,
        subagent_exited_retention: Duration,
        approvals: Arc<ApprovalManager>,
        queue: Arc<QueuePoller>,
        supervisor: Arc<Supervisor>,
        bus: Arc<EventBus>,
        behaviors: Vec<Arc<dyn PeriodicBehavior>>,
    ) -> Self {
        let (thinking_tx, thinking_rx) = watch::channel(ThinkingLevel::default());
        AgenticLoop {
            tick_interval,
            subagent_exited_retention,
            approvals,
            queue,
            supervisor,
            bus,
            behaviors,
            thinking_tx,
            thinking_rx,
            running: Mutex::new(None),
        }
    }

    pub fn thinking_level(&self) -> ThinkingLevel {
        *self.thinking_rx.borrow()
    }

    pub fn set_thinking_level(&self, level: ThinkingLevel) {
        let _ = self.thinking_tx.send(level);
    }

    /// Start the loop's background task. A second call while already
    /// running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.tick_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let outcome = this.tick().await;
                        log::debug!(
                            "agentic_loop tick: approvals_swept={} agents_reaped={} agents_expired={} tasks_processed={} behaviors_run={} behaviors_failed={}",
                            outcome.approvals_swept, outcome.agents_reaped, outcome.agents_expired, outcome.tasks_processed,
                            outcome.behaviors_run, outcome.behaviors_failed,
                        );
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });

        *running = Some((stop_tx, handle));
    }

    /// Stop the loop and wait for its background task to exit. A call while
    /// not running is a no-op.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some((stop_tx, handle)) = running.take() {
            let _ = stop_tx.send(true);
            let _ = handle.await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    async fn tick(&self) -> TickOutcome {
        let approvals_swept = self.approvals.sweep_expired().await;

        let now = Utc::now();
        let agents_reaped = self.supervisor.reap_exited(self.subagent_exited_retention, now).await;
        let agents_expired = self.supervisor.enforce_max_lifetimes(now).await;

        let tasks_processed = match self.queue.poll_once().await {
            Ok(n) => n,
            Err(e) => {
                log::warn!("agentic_loop: queue poll failed this tick: {}", e);
                0
            }
        };

        let mut behaviors_run = 0;
        let mut behaviors_failed = 0;
        for behavior in &self.behaviors {
            match behavior.run().await {
                Ok(()) => behaviors_run += 1,
                Err(e) => {
                    behaviors_failed += 1;
                    log::warn!("agentic_loop: periodic behavior '{}' failed this tick: {}", behavior.name(), e);
                }
            }
        }

        self.bus
            .publish(
                Topic::AgentReady,
                serde_json::json!({
                    "approvals_swept": approvals_swept,
                    "agents_reaped": agents_reaped,
                    "agents_expired": agents_expired,
                    "tasks_processed": tasks_processed,
                    "thinking_level": self.thinking_level().as_str(),
                }),
            )
            .await;

        TickOutcome { approvals_swept, agents_reaped, agents_expired, tasks_processed, behaviors_run, behaviors_failed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::approval::ApprovalPolicy;
    use crate::core::broker::BrokerClient;
    use crate::core::external::NotificationChannel;
    use crate::core::kv_store::InMemoryKvStore;
    use crate::core::thought_log::ThoughtLog;
    use crate::core::workspace::Workspace;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct NoopNotifier;
    #[async_trait]
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

    struct CountingBehavior {
        runs: Arc<AtomicUsize>,
    }
    #[async_trait]
    impl PeriodicBehavior for CountingBehavior {
        fn name(&self) -> &str {
            "counting"
        }
        async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingBehavior;
    #[async_trait]
    impl PeriodicBehavior for FailingBehavior {
        fn name(&self) -> &str {
            "failing"
        }
        async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
            Err("always fails".into())
        }
    }

    async fn build_loop(dir: &TempDir, behaviors: Vec<Arc<dyn PeriodicBehavior>>) -> Arc<AgenticLoop> {
        let audit = ThoughtLog::open(&dir.path().to_path_buf(), "loop").unwrap();
        let approvals = Arc::new(ApprovalManager::new(
            ApprovalPolicy {
                contract_whitelist: vec![],
                auto_cap_per_tx: 0,
                auto_cap_per_day: 0,
                ttl: Duration::from_secs(600),
            },
            Arc::new(NoopNotifier),
            audit,
        ));
        let queue = Arc::new(QueuePoller::new(Arc::new(InMemoryKvStore::new()), 3, Duration::from_secs(3600)));
        let workspace = Arc::new(Workspace::new(dir.path().to_path_buf(), 1024));
        let broker = Arc::new(BrokerClient::spawn("true", &[], Duration::from_secs(5)).await.unwrap());
        let supervisor = Arc::new(Supervisor::new(
            "true",
            vec![],
            4,
            Duration::from_secs(10),
            Duration::from_secs(60),
            Duration::from_secs(5),
            Duration::from_secs(300),
            workspace,
            broker,
        ));
        let bus = Arc::new(EventBus::new(8));

        Arc::new(AgenticLoop::new(
            Duration::from_millis(20),
            Duration::from_secs(60),
            approvals,
            queue,
            supervisor,
            bus,
            behaviors,
        ))
    }

    #[tokio::test]
    async fn start_runs_ticks_and_stop_halts_them() {
        let dir = TempDir::new().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let agentic_loop = build_loop(&dir, vec![Arc::new(CountingBehavior { runs: runs.clone() })]).await;

        agentic_loop.start().await;
        tokio::time::sleep(Duration::from_millis(70)).await;
        agentic_loop.stop().await;

        let observed = runs.load(Ordering::SeqCst);
        assert!(observed >= 2, "expected multiple ticks, got {}", observed);

        let after_stop = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn failing_behavior_does_not_stop_the_tick() {
        let dir = TempDir::new().unwrap();
        let agentic_loop = build_loop(&dir, vec![Arc::new(FailingBehavior)]).await;
        let outcome = agentic_loop.tick().await;
        assert_eq!(outcome.behaviors_failed, 1);
        assert_eq!(outcome.behaviors_run, 0);
    }

    #[tokio::test]
    async fn set_thinking_level_is_observed_immediately() {
        let dir = TempDir::new().unwrap();
        let agentic_loop = build_loop(&dir, vec![]).await;
        assert_eq!(agentic_loop.thinking_level(), ThinkingLevel::default());
        agentic_loop.set_thinking_level(ThinkingLevel::High);
        assert_eq!(agentic_loop.thinking_level(), ThinkingLevel::High);
    }

    #[tokio::test]
    async fn starting_twice_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let agentic_loop = build_loop(&dir, vec![]).await;
        agentic_loop.start().await;
        agentic_loop.start().await;
        assert!(agentic_loop.is_running().await);
        agentic_loop.stop().await;
        assert!(!agentic_loop.is_running().await);
    }
}
