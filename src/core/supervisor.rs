//! Sub-agent supervisor: spawns and tracks short-lived worker processes,
//! one per delegated task.
//!
//! Each sub-agent is a child process speaking the same length-prefixed JSON
//! framing ([`crate::core::wire`]) the secrets broker uses, over its own
//! stdio pipes. The supervisor owns the sub-agent record table exclusively
//! (mirroring [`crate::core::dispatcher::Dispatcher`]'s exclusive ownership
//! of RPC records) and gates `workspace_write` capability requests through
//! [`crate::core::workspace::Workspace`] before ever touching disk on a
//! sub-agent's behalf.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::core::broker::BrokerClient;
use crate::core::wire::{read_frame, write_frame, FramingError};
use crate::core::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum Role {
    NewsCurator,
    DefiMonitor,
    ContentCreator,
    Research,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::NewsCurator => "news_curator",
            Role::DefiMonitor => "defi_monitor",
            Role::ContentCreator => "content_creator",
            Role::Research => "research",
        }
    }

    pub fn capabilities(&self) -> &'static [&'static str] {
        match self {
            Role::NewsCurator => &["network_fetch"],
            Role::DefiMonitor => &["network_fetch", "chain_read"],
            Role::ContentCreator => &["network_fetch", "workspace_write"],
            Role::Research => &["network_fetch", "workspace_write"],
        }
    }

    pub fn allows(&self, capability: &str) -> bool {
        self.capabilities().contains(&capability)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Starting,
    Idle,
    Busy,
    Exited,
    Error,
}

#[derive(Debug, Clone)]
pub enum SupervisorError {
    UnknownRole(String),
    ConcurrencyCapReached,
    StartupTimedOut,
    TaskTimedOut,
    AgentBusy,
    AgentNotFound,
    CapabilityDenied(String),
    Transport(String),
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorError::UnknownRole(r) => write!(f, "unknown_role: {}", r),
            SupervisorError::ConcurrencyCapReached => write!(f, "concurrency_cap_reached"),
            SupervisorError::StartupTimedOut => write!(f, "startup_timed_out"),
            SupervisorError::TaskTimedOut => write!(f, "task_timed_out"),
            SupervisorError::AgentBusy => write!(f, "agent_busy"),
            SupervisorError::AgentNotFound => write!(f, "agent not found"),
            SupervisorError::CapabilityDenied(cap) => write!(f, "capability_denied: {}", cap),
            SupervisorError::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl Error for SupervisorError {}

impl From<FramingError> for SupervisorError {
    fn from(e: FramingError) -> Self {
        SupervisorError::Transport(e.to_string())
    }
}

/// Parent-to-child wire messages. `Init` is sent once right after the
/// child's ready frame; `Task` starts a task exchange; `WorkspaceWriteAck`
/// and `LlmResult` are replies to child-initiated requests mid-task;
/// `Shutdown` requests a clean exit ahead of `stop`'s stdin-close/kill path.
#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ParentMessage {
    Init { role: String, capabilities: Vec<String>, max_lifetime_secs: u64 },
    Task { task_id: Uuid, capability: String, payload: serde_json::Value },
    WorkspaceWriteAck { ok: bool, error: Option<String> },
    LlmResult { req_id: String, content: Option<String>, error: Option<String> },
    #[allow(dead_code)]
    Shutdown,
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum TaskResponse {
    Ok { result: serde_json::Value },
    Error { message: String },
    WorkspaceWrite { path: String, content_base64: String },
    LlmRequest { req_id: String, prompt: String, params: serde_json::Value },
}

pub struct AgentRecord {
    pub id: Uuid,
    pub role: Role,
    pub state: AgentState,
    pub spawned_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub current_task_id: Option<Uuid>,
    pub task_count: u64,
    pub exit_code: Option<i32>,
}

struct ChildIo {
    stdin: ChildStdin,
    stdout: ChildStdout,
    #[allow(dead_code)]
    child: Child,
}

struct Agent {
    record: AgentRecord,
    io: Mutex<Option<ChildIo>>,
}

/// Owns every sub-agent's lifecycle record and IPC channel.
pub struct Supervisor {
    command: String,
    args: Vec<String>,
    max_concurrency: usize,
    startup_timeout: Duration,
    task_timeout: Duration,
    stop_grace_period: Duration,
    max_lifetime: Duration,
    agents: RwLock<HashMap<Uuid, Agent>>,
    workspace: Arc<Workspace>,
    broker: Arc<BrokerClient>,
}

impl Supervisor {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        max_concurrency: usize,
        startup_timeout: Duration,
        task_timeout: Duration,
        stop_grace_period: Duration,
        max_lifetime: Duration,
        workspace: Arc<Workspace>,
        broker: Arc<BrokerClient>,
    ) -> Self {
        Supervisor {
            command: command.into(),
            args,
            max_concurrency,
            startup_timeout,
            task_timeout,
            stop_grace_period,
            max_lifetime,
            agents: RwLock::new(HashMap::new()),
            workspace,
            broker,
        }
    }

    async fn running_count(&self) -> usize {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| matches!(a.record.state, AgentState::Starting | AgentState::Idle | AgentState::Busy))
            .count()
    }

    /// Spawn a new sub-agent of `role`, passing the role name as its sole
    /// argument. Rejects the spawn if the concurrency cap is already
    /// reached.
    pub async fn spawn(&self, role: Role) -> Result<Uuid, SupervisorError> {
        if self.running_count().await >= self.max_concurrency {
            return Err(SupervisorError::ConcurrencyCapReached);
        }

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd.arg(role.as_str());
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::null());

        let mut child = cmd.spawn().map_err(|e| SupervisorError::Transport(e.to_string()))?;
        let mut stdin = child.stdin.take().ok_or_else(|| SupervisorError::Transport("no stdin".into()))?;
        let mut stdout = child.stdout.take().ok_or_else(|| SupervisorError::Transport("no stdout".into()))?;

        let ready: Result<serde_json::Value, FramingError> =
            tokio::time::timeout(self.startup_timeout, read_frame(&mut stdout, 64 * 1024))
                .await
                .map_err(|_| FramingError::ConnectionClosed)?;
        if ready.is_err() {
            let _ = child.kill().await;
            return Err(SupervisorError::StartupTimedOut);
        }

        let init = ParentMessage::Init {
            role: role.as_str().to_string(),
            capabilities: role.capabilities().iter().map(|c| c.to_string()).collect(),
            max_lifetime_secs: self.max_lifetime.as_secs(),
        };
        if write_frame(&mut stdin, &init).await.is_err() {
            let _ = child.kill().await;
            return Err(SupervisorError::Transport("init handshake failed".into()));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let agent = Agent {
            record: AgentRecord {
                id,
                role,
                state: AgentState::Idle,
                spawned_at: now,
                expires_at: now
                    + chrono::Duration::from_std(self.max_lifetime).unwrap_or_else(|_| chrono::Duration::days(365)),
                current_task_id: None,
                task_count: 0,
                exit_code: None,
            },
            io: Mutex::new(Some(ChildIo { stdin, stdout, child })),
        };
        self.agents.write().await.insert(id, agent);
        Ok(id)
    }

    /// Run one task on `agent_id`. Denies the request outright if the
    /// agent's role does not carry `capability`. A `workspace_write`
    /// response from the child is validated through the workspace jail
    /// before being written to disk; any other response is handed back
    /// unmodified.
    pub async fn run_task(
        &self,
        agent_id: Uuid,
        capability: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, SupervisorError> {
        let role = {
            let mut agents = self.agents.write().await;
            let agent = agents.get_mut(&agent_id).ok_or(SupervisorError::AgentNotFound)?;
            if !agent.record.role.allows(capability) {
                return Err(SupervisorError::CapabilityDenied(capability.to_string()));
            }
            if agent.record.state != AgentState::Idle {
                return Err(SupervisorError::AgentBusy);
            }
            agent.record.state = AgentState::Busy;
            let task_id = Uuid::new_v4();
            agent.record.current_task_id = Some(task_id);
            agent.record.role
        };

        let task_id = {
            let agents = self.agents.read().await;
            agents.get(&agent_id).and_then(|a| a.record.current_task_id).unwrap()
        };

        let result = self
            .exchange(agent_id, capability, task_id, payload)
            .await;

        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.get_mut(&agent_id) {
            agent.record.current_task_id = None;
            agent.record.task_count += 1;
            agent.record.state = if result.is_ok() { AgentState::Idle } else { AgentState::Error };
        }
        let _ = role;
        result
    }

    /// Drive one task to completion, proxying as many child requests as the
    /// child sends before its final `ok`/`error`: a `workspace_write` is
    /// checked against the agent's role and acknowledged, an `llm_request`
    /// is forwarded to the secrets broker and answered with `llm_result`.
    /// Neither request ends the exchange; only `Ok`/`Error` does.
    async fn exchange(
        &self,
        agent_id: Uuid,
        capability: &str,
        task_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, SupervisorError> {
        let role = {
            let agents = self.agents.read().await;
            agents.get(&agent_id).ok_or(SupervisorError::AgentNotFound)?.record.role
        };

        let call = async {
            let agents = self.agents.read().await;
            let agent = agents.get(&agent_id).ok_or(SupervisorError::AgentNotFound)?;
            let mut guard = agent.io.lock().await;
            let io = guard.as_mut().ok_or(SupervisorError::Transport("agent io closed".into()))?;

            let request = ParentMessage::Task { task_id, capability: capability.to_string(), payload };
            write_frame(&mut io.stdin, &request).await?;

            loop {
                let response: TaskResponse = read_frame(&mut io.stdout, 1024 * 1024).await?;
                match response {
                    TaskResponse::Ok { result } => return Ok(result),
                    TaskResponse::Error { message } => return Err(SupervisorError::Transport(message)),
                    TaskResponse::WorkspaceWrite { path, content_base64 } => {
                        let ack = if role.allows("workspace_write") {
                            match base64_decode(&content_base64)
                                .map_err(|e| format!("malformed base64: {}", e))
                                .and_then(|bytes| self.workspace.write(&path, &bytes).map_err(|e| e.to_string()))
                            {
                                Ok(_) => ParentMessage::WorkspaceWriteAck { ok: true, error: None },
                                Err(e) => ParentMessage::WorkspaceWriteAck { ok: false, error: Some(e) },
                            }
                        } else {
                            log::warn!(
                                "supervisor: agent {} (role {}) lacks workspace_write, dropping write to '{}'",
                                agent_id, role.as_str(), path,
                            );
                            ParentMessage::WorkspaceWriteAck {
                                ok: false,
                                error: Some("capability_denied: workspace_write".to_string()),
                            }
                        };
                        write_frame(&mut io.stdin, &ack).await?;
                    }
                    TaskResponse::LlmRequest { req_id, prompt, params } => {
                        let reply = match self.broker.llm_complete(&prompt, params).await {
                            Ok(content) => ParentMessage::LlmResult { req_id, content: Some(content), error: None },
                            Err(e) => ParentMessage::LlmResult { req_id, content: None, error: Some(e.to_string()) },
                        };
                        write_frame(&mut io.stdin, &reply).await?;
                    }
                }
            }
        };

        tokio::time::timeout(self.task_timeout, call)
            .await
            .map_err(|_| SupervisorError::TaskTimedOut)?
    }

    /// Stop an agent: ask it to exit by closing stdin, wait up to the grace
    /// period, then kill. Transitions to `exited` either way.
    pub async fn stop(&self, agent_id: Uuid) -> Result<(), SupervisorError> {
        let mut agents = self.agents.write().await;
        let agent = agents.get_mut(&agent_id).ok_or(SupervisorError::AgentNotFound)?;
        let mut guard = agent.io.lock().await;
        if let Some(mut io) = guard.take() {
            drop(io.stdin);
            let exit = tokio::time::timeout(self.stop_grace_period, io.child.wait()).await;
            let code = match exit {
                Ok(Ok(status)) => status.code(),
                _ => {
                    let _ = io.child.kill().await;
                    None
                }
            };
            agent.record.exit_code = code;
        }
        agent.record.state = AgentState::Exited;
        Ok(())
    }

    pub async fn state_of(&self, agent_id: Uuid) -> Option<AgentState> {
        self.agents.read().await.get(&agent_id).map(|a| a.record.state)
    }

    /// Drop every record that has been in `exited` for longer than
    /// `retention`.
    pub async fn reap_exited(&self, retention: Duration, now: DateTime<Utc>) -> usize {
        let mut agents = self.agents.write().await;
        let before = agents.len();
        agents.retain(|_, a| {
            if a.record.state != AgentState::Exited {
                return true;
            }
            (now - a.record.spawned_at).to_std().map(|age| age < retention).unwrap_or(true)
        });
        before - agents.len()
    }

    /// Stop every running agent whose `max_lifetime` deadline has passed.
    /// Returns the number of agents stopped.
    pub async fn enforce_max_lifetimes(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<Uuid> = {
            let agents = self.agents.read().await;
            agents
                .values()
                .filter(|a| {
                    matches!(a.record.state, AgentState::Starting | AgentState::Idle | AgentState::Busy)
                        && now >= a.record.expires_at
                })
                .map(|a| a.record.id)
                .collect()
        };
        for id in &expired {
            log::warn!("supervisor: agent {} exceeded its max lifetime, stopping", id);
            let _ = self.stop(*id).await;
        }
        expired.len()
    }
}

fn base64_decode(s: &str) -> Result<Vec<u8>, String> {
    const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut reverse = [0xffu8; 256];
    for (i, &c) in ALPHABET.iter().enumerate() {
        reverse[c as usize] = i as u8;
    }

    let stripped: Vec<u8> = s.bytes().filter(|&b| b != b'=').collect();
    let mut out = Vec::with_capacity(stripped.len() * 3 / 4);
    for chunk in stripped.chunks(4) {
        let mut buf = [0u8; 4];
        for (i, &b) in chunk.iter().enumerate() {
            let v = reverse[b as usize];
            if v == 0xff {
                return Err("invalid base64 character".to_string());
            }
            buf[i] = v;
        }
        let n = chunk.len();
        out.push((buf[0] << 2) | (buf[1] >> 4));
        if n > 2 {
            out.push((buf[1] << 4) | (buf[2] >> 2));
        }
        if n > 3 {
            out.push((buf[2] << 6) | buf[3]);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_capabilities_gate_workspace_write() {
        assert!(Role::ContentCreator.allows("workspace_write"));
        assert!(!Role::NewsCurator.allows("workspace_write"));
    }

    #[test]
    fn role_capabilities_gate_chain_read() {
        assert!(Role::DefiMonitor.allows("chain_read"));
        assert!(!Role::Research.allows("chain_read"));
    }

    #[test]
    fn base64_decode_round_trips_known_vector() {
        // "hello" base64-encoded, verified against a known reference value.
        assert_eq!(base64_decode("aGVsbG8=").unwrap(), b"hello");
    }

    #[test]
    fn base64_decode_rejects_invalid_character() {
        assert!(base64_decode("!!!!").is_err());
    }
}
