//! Runtime configuration.
//!
//! [`RuntimeConfig`] collects every tunable named across the runtime's
//! components. Callers construct it manually — no TOML/YAML/JSON config-file
//! parsing dependency is introduced, the same way the teacher's own
//! top-level config struct was constructed directly by its embedding binary.
//!
//! # Example
//!
//! ```rust
//! use agentcore::core::config::RuntimeConfig;
//! use std::path::PathBuf;
//!
//! let config = RuntimeConfig {
//!     workspace_root: PathBuf::from("/var/data/agent_workspace"),
//!     ..RuntimeConfig::default()
//! };
//! assert_eq!(config.approval_ttl.as_secs(), 600);
//! ```

use std::path::PathBuf;
use std::time::Duration;

/// Global configuration for the runtime. Intentionally a plain struct with a
/// `Default` impl — embedding binaries construct it however they want.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// The single on-disk directory every component may write into.
    pub workspace_root: PathBuf,
    /// Per-file write cap inside the workspace. Default 50 KiB.
    pub workspace_write_cap: usize,

    /// Directory where hash-chained audit logs (`thought_log::ThoughtLog`) are stored.
    pub audit_log_dir: PathBuf,

    /// Outbound network fetch timeout. Default 10s.
    pub network_fetch_timeout: Duration,
    /// Outbound response size cap. Default 1 MiB.
    pub network_max_response_size: usize,
    /// Per-host rate limit token budget per window.
    pub network_rate_limit_tokens: f64,
    /// Per-host rate limit window. Default 60s.
    pub network_rate_limit_window: Duration,

    /// LLM request timeout via the secrets broker. Default 30s.
    pub llm_request_timeout: Duration,

    /// Sub-agent process startup deadline. Default 10s.
    pub subagent_startup_timeout: Duration,
    /// Sub-agent task execution deadline. Default 60s.
    pub subagent_task_timeout: Duration,
    /// Supervisor concurrency cap (max simultaneously running sub-agents). Default 4.
    pub supervisor_max_concurrency: usize,
    /// Grace period given to a sub-agent to shut down cleanly before it is killed. Default 5s.
    pub supervisor_stop_grace_period: Duration,
    /// How long an exited sub-agent record is retained before being purged. Default 60s.
    pub subagent_exited_retention: Duration,
    /// Max wall-clock lifetime granted to a sub-agent at spawn, sent as part
    /// of its init handshake and enforced by the agentic loop. Default 5 minutes.
    pub subagent_max_lifetime: Duration,

    /// Approval TTL: how long a pending approval waits before auto-expiring. Default 10 minutes.
    pub approval_ttl: Duration,
    /// Interval at which the approval manager sweeps for expired approvals. Default 60s.
    pub approval_sweep_interval: Duration,
    /// Max value (in the runtime's accounting unit) auto-approved per transaction without a human.
    pub approval_auto_cap_per_tx: u64,
    /// Max aggregate value auto-approved per rolling day.
    pub approval_auto_cap_per_day: u64,

    /// Task queue polling interval. Default 5s.
    pub queue_poll_interval: Duration,
    /// Max tasks claimed per poll batch. Default 3.
    pub queue_poll_batch_size: usize,
    /// How long a completed task record is retained before purge. Default 1 hour.
    pub task_completed_retention: Duration,

    /// Event bus per-subscriber bounded queue capacity. Default 256.
    pub bus_queue_capacity: usize,

    /// Max RPC envelope size accepted by the gateway. Default 1 MiB.
    pub gateway_envelope_cap: usize,

    /// Chat session rolling history length (number of exchanges retained). Default 10-20; 16 chosen.
    pub chat_history_len: usize,

    /// Agentic loop heartbeat cadence. Default 60s.
    pub agentic_loop_tick: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("workspace"),
            workspace_write_cap: 50 * 1024,

            audit_log_dir: PathBuf::from("audit_logs"),

            network_fetch_timeout: Duration::from_secs(10),
            network_max_response_size: 1024 * 1024,
            network_rate_limit_tokens: 30.0,
            network_rate_limit_window: Duration::from_secs(60),

            llm_request_timeout: Duration::from_secs(30),

            subagent_startup_timeout: Duration::from_secs(10),
            subagent_task_timeout: Duration::from_secs(60),
            supervisor_max_concurrency: 4,
            supervisor_stop_grace_period: Duration::from_secs(5),
            subagent_exited_retention: Duration::from_secs(60),
            subagent_max_lifetime: Duration::from_secs(300),

            approval_ttl: Duration::from_secs(600),
            approval_sweep_interval: Duration::from_secs(60),
            approval_auto_cap_per_tx: 100,
            approval_auto_cap_per_day: 1_000,

            queue_poll_interval: Duration::from_secs(5),
            queue_poll_batch_size: 3,
            task_completed_retention: Duration::from_secs(3600),

            bus_queue_capacity: 256,

            gateway_envelope_cap: 1024 * 1024,

            chat_history_len: 16,

            agentic_loop_tick: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_named_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.network_fetch_timeout, Duration::from_secs(10));
        assert_eq!(config.network_max_response_size, 1024 * 1024);
        assert_eq!(config.approval_ttl, Duration::from_secs(600));
        assert_eq!(config.workspace_write_cap, 50 * 1024);
        assert_eq!(config.queue_poll_batch_size, 3);
    }
}
