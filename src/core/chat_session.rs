//! Chat session: a single conversation's rolling history, thinking-level
//! command handling, tool-intent extraction, and file-write staging.
//!
//! One `ChatSession` per owner. Inbound text is published onto
//! [`crate::core::bus::Topic::MessageInbound`] before anything else happens,
//! so every other component can observe traffic without being on the
//! critical path of producing a reply.

use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::broker::BrokerClient;
use crate::core::bus::{EventBus, Topic};
use crate::core::thinking::{self, ThinkingLevel};
use crate::core::workspace::Workspace;

const THINKING_COMMAND_PREFIX: &str = "thinking";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

/// A `write:<path>` fenced block extracted from a reply, staged for the
/// caller to commit through the workspace jail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileWriteBlock {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub enum ChatError {
    NotOwner,
    Broker(String),
    WorkspaceRejected(String),
    MissingField(String),
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::NotOwner => write!(f, "not_owner"),
            ChatError::Broker(m) => write!(f, "broker error: {}", m),
            ChatError::WorkspaceRejected(m) => write!(f, "workspace rejected: {}", m),
            ChatError::MissingField(name) => write!(f, "missing_field: {}", name),
        }
    }
}

impl Error for ChatError {}

/// A structured tool intent extracted from free text by a dedicated
/// low-temperature classification call. Closed on purpose: every variant
/// carries exactly the fields its deterministic handler needs, and a field
/// absent from the classifier's JSON output is a [`ChatError::MissingField`],
/// never guessed.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Send { to: String, value: u64, chain: String, data: Option<String> },
    Swap { from_token: String, to_token: String, amount: u64, chain: String },
    Deploy { bytecode: String, chain: String },
    Balance { address: String, chain: String },
    None,
}

const INTENT_CLASSIFIER_PROMPT: &str = "Classify the user's message into exactly one intent and \
respond with a single JSON object only, no prose, no markdown fence. \
Schema: {\"intent\": \"send\"|\"swap\"|\"deploy\"|\"balance\"|\"none\", ...fields}. \
\"send\" requires to, value, chain and optional data. \
\"swap\" requires from_token, to_token, amount, chain. \
\"deploy\" requires bytecode, chain. \
\"balance\" requires address, chain. \
Use \"none\" if the message requests no on-chain action. \
Only use a field value the user actually stated; never invent one.";

const INTENT_CLASSIFIER_TEMPERATURE: f32 = 0.0;
const INTENT_CLASSIFIER_MAX_TOKENS: u32 = 256;

fn required_str(value: &serde_json::Value, field: &str) -> Result<String, ChatError> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ChatError::MissingField(field.to_string()))
}

fn required_u64(value: &serde_json::Value, field: &str) -> Result<u64, ChatError> {
    value
        .get(field)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| ChatError::MissingField(field.to_string()))
}

/// Parse the classifier's JSON output into a closed [`Intent`]. An
/// unrecognized or absent `intent` tag is `Intent::None`, not an error —
/// only a *recognized* intent with a missing required field is an error.
fn parse_intent(value: &serde_json::Value) -> Result<Intent, ChatError> {
    match value.get("intent").and_then(|v| v.as_str()).unwrap_or("none") {
        "send" => Ok(Intent::Send {
            to: required_str(value, "to")?,
            value: required_u64(value, "value")?,
            chain: required_str(value, "chain")?,
            data: value.get("data").and_then(|v| v.as_str()).map(|s| s.to_string()),
        }),
        "swap" => Ok(Intent::Swap {
            from_token: required_str(value, "from_token")?,
            to_token: required_str(value, "to_token")?,
            amount: required_u64(value, "amount")?,
            chain: required_str(value, "chain")?,
        }),
        "deploy" => Ok(Intent::Deploy {
            bytecode: required_str(value, "bytecode")?,
            chain: required_str(value, "chain")?,
        }),
        "balance" => Ok(Intent::Balance {
            address: required_str(value, "address")?,
            chain: required_str(value, "chain")?,
        }),
        _ => Ok(Intent::None),
    }
}

/// The deterministic handler for a detected intent: every field it reports
/// came straight from `parse_intent`'s validation, nothing is inferred or
/// completed by an LLM. Actual on-chain execution is gated by the approval
/// manager downstream of this reply, not performed here.
fn render_intent_confirmation(intent: &Intent) -> String {
    match intent {
        Intent::Send { to, value, chain, .. } => {
            format!("queued: send {} to {} on {}", value, to, chain)
        }
        Intent::Swap { from_token, to_token, amount, chain } => {
            format!("queued: swap {} {} for {} on {}", amount, from_token, to_token, chain)
        }
        Intent::Deploy { chain, .. } => format!("queued: contract deployment on {}", chain),
        Intent::Balance { address, chain } => format!("balance lookup for {} on {}", address, chain),
        Intent::None => unreachable!("render_intent_confirmation is never called for Intent::None"),
    }
}

/// The response produced by one turn: the reply text, any extracted
/// file-write blocks (already validated against the workspace jail, not yet
/// written), and the thinking level that produced it.
pub struct TurnOutcome {
    pub reply: String,
    pub file_writes: Vec<FileWriteBlock>,
    pub thinking_level: ThinkingLevel,
}

/// One conversation. Only its `owner` may drive it; every other caller is
/// rejected with [`ChatError::NotOwner`].
pub struct ChatSession {
    owner: String,
    history: std::sync::Mutex<VecDeque<Turn>>,
    history_len: usize,
    thinking_level: std::sync::Mutex<ThinkingLevel>,
    broker: Arc<BrokerClient>,
    bus: Arc<EventBus>,
    workspace: Arc<Workspace>,
}

impl ChatSession {
    pub fn new(owner: impl Into<String>, history_len: usize, broker: Arc<BrokerClient>, bus: Arc<EventBus>, workspace: Arc<Workspace>) -> Self {
        ChatSession {
            owner: owner.into(),
            history: std::sync::Mutex::new(VecDeque::with_capacity(history_len)),
            history_len,
            thinking_level: std::sync::Mutex::new(ThinkingLevel::default()),
            broker,
            bus,
            workspace,
        }
    }

    fn push_turn(&self, turn: Turn) {
        let mut history = self.history.lock().unwrap();
        history.push_back(turn);
        while history.len() > self.history_len {
            history.pop_front();
        }
    }

    fn render_history(&self) -> String {
        let history = self.history.lock().unwrap();
        history
            .iter()
            .map(|t| format!("{}: {}", if t.role == Role::User { "user" } else { "assistant" }, t.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn thinking_level(&self) -> ThinkingLevel {
        *self.thinking_level.lock().unwrap()
    }

    /// Handle one inbound message from `caller`. Rejects callers other than
    /// this session's owner before anything else runs.
    pub async fn handle_message(&self, caller: &str, text: &str) -> Result<TurnOutcome, ChatError> {
        if caller != self.owner {
            return Err(ChatError::NotOwner);
        }

        self.bus
            .publish(Topic::MessageInbound, serde_json::json!({ "caller": caller, "text": text }))
            .await;

        if let Some(level) = thinking::parse_command(text, THINKING_COMMAND_PREFIX) {
            *self.thinking_level.lock().unwrap() = level;
            return Ok(TurnOutcome {
                reply: format!("thinking level set to {}", level.as_str()),
                file_writes: vec![],
                thinking_level: level,
            });
        }

        self.push_turn(Turn { role: Role::User, content: text.to_string() });

        let level = self.thinking_level();

        let intent = self.classify_intent(text).await?;
        if intent != Intent::None {
            let reply = render_intent_confirmation(&intent);
            self.push_turn(Turn { role: Role::Assistant, content: reply.clone() });
            return Ok(TurnOutcome { reply, file_writes: vec![], thinking_level: level });
        }

        let params = thinking::params_for(level);
        let prompt = format!("{}\n{}\nuser: {}", params.system_suffix, self.render_history(), text);

        let reply = self
            .broker
            .llm_complete(
                &prompt,
                serde_json::json!({ "temperature": params.temperature, "max_tokens": params.max_tokens }),
            )
            .await
            .map_err(|e| ChatError::Broker(e.to_string()))?;

        self.push_turn(Turn { role: Role::Assistant, content: reply.clone() });

        let file_writes = extract_file_write_blocks(&reply, &self.workspace);

        Ok(TurnOutcome { reply, file_writes, thinking_level: level })
    }

    /// Ask a dedicated low-temperature broker call to classify `text` into
    /// a closed [`Intent`]. A reply that isn't valid JSON is treated as
    /// `Intent::None` rather than an error — the user just gets the normal
    /// completion path.
    async fn classify_intent(&self, text: &str) -> Result<Intent, ChatError> {
        let prompt = format!("{}\nuser: {}", INTENT_CLASSIFIER_PROMPT, text);
        let raw = self
            .broker
            .llm_complete(
                &prompt,
                serde_json::json!({
                    "temperature": INTENT_CLASSIFIER_TEMPERATURE,
                    "max_tokens": INTENT_CLASSIFIER_MAX_TOKENS,
                }),
            )
            .await
            .map_err(|e| ChatError::Broker(e.to_string()))?;

        let value: serde_json::Value = serde_json::from_str(raw.trim()).unwrap_or(serde_json::Value::Null);
        parse_intent(&value)
    }
}

/// Extract every ` ```write:<path>\n...\n``` ` fenced block from `text` and
/// validate each path through the workspace jail. A block whose path escapes
/// the jail is dropped rather than surfacing a write that can never succeed.
fn extract_file_write_blocks(text: &str, workspace: &Workspace) -> Vec<FileWriteBlock> {
    let mut blocks = Vec::new();
    let mut rest = text;
    let fence_open = "```write:";

    while let Some(start) = rest.find(fence_open) {
        let after_marker = &rest[start + fence_open.len()..];
        let newline = match after_marker.find('\n') {
            Some(n) => n,
            None => break,
        };
        let path = after_marker[..newline].trim().to_string();
        let body = &after_marker[newline + 1..];

        let close = match body.find("```") {
            Some(c) => c,
            None => break,
        };
        let content = body[..close].to_string();

        if workspace.resolve(&path).is_ok() {
            blocks.push(FileWriteBlock { path, content });
        }

        rest = &body[close + 3..];
    }

    blocks
}
