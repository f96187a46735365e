//! Secrets broker client.
//!
//! The broker is a separate local process holding every credential and
//! signing key; this process never sees raw key material. Requests and
//! responses are exchanged as length-prefixed JSON frames
//! ([`crate::core::wire`]) over the child's stdio, the same framing the
//! sub-agent supervisor and gateway duplex transport use.
//!
//! If the broker fails its startup health check, the client enters
//! `Degraded` mode: every call fails immediately with
//! [`BrokerError::Unavailable`] (logged once at `warn`) while a background
//! task — grounded on the same "keep retrying a shared resource in the
//! background" idea as the teacher's pooled-client refresh — periodically
//! retries the health check and flips the client back to healthy.

use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::core::wire::{read_frame, write_frame, FramingError};

const ENVELOPE_CAP: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub enum BrokerError {
    Unavailable,
    CapabilityMissing(String),
    Remote(String),
    Transport(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Unavailable => write!(f, "broker_unavailable"),
            BrokerError::CapabilityMissing(cap) => write!(f, "capability_missing: {}", cap),
            BrokerError::Remote(msg) => write!(f, "broker error: {}", msg),
            BrokerError::Transport(msg) => write!(f, "broker transport error: {}", msg),
        }
    }
}

impl Error for BrokerError {}

impl From<FramingError> for BrokerError {
    fn from(e: FramingError) -> Self {
        BrokerError::Transport(e.to_string())
    }
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Health,
    LlmComplete { prompt: String, params: serde_json::Value },
    Embed { text: String },
    SignMessage { message_hex: String },
    SignTypedData { payload: serde_json::Value },
    GetAddress,
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Response {
    Ok { result: serde_json::Value },
    Error { message: String },
}

struct ChildIo {
    stdin: ChildStdin,
    stdout: ChildStdout,
    #[allow(dead_code)]
    child: Child,
}

struct Inner {
    io: Mutex<Option<ChildIo>>,
    healthy: AtomicBool,
    request_timeout: Duration,
}

/// Client side of the secrets broker IPC channel. Cheap to clone: every
/// clone shares the same child process handle and health flag.
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<Inner>,
}

impl BrokerClient {
    /// Spawn the broker child process and run its startup health check.
    /// Sensitive environment variables are not inherited from this process;
    /// the broker is expected to already hold its own credentials.
    pub async fn spawn(command: &str, args: &[&str], request_timeout: Duration) -> Result<Self, BrokerError> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        cmd.env_clear();
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::null());

        let mut child = cmd.spawn().map_err(|e| BrokerError::Transport(e.to_string()))?;
        let stdin = child.stdin.take().ok_or_else(|| BrokerError::Transport("no stdin".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| BrokerError::Transport("no stdout".into()))?;

        let client = BrokerClient {
            inner: Arc::new(Inner {
                io: Mutex::new(Some(ChildIo { stdin, stdout, child })),
                healthy: AtomicBool::new(false),
                request_timeout,
            }),
        };

        match client.health().await {
            Ok(()) => client.inner.healthy.store(true, Ordering::SeqCst),
            Err(e) => {
                log::warn!("BrokerClient::spawn: startup health check failed, entering degraded mode: {}", e);
                client.spawn_reconnect_task();
            }
        }

        Ok(client)
    }

    fn spawn_reconnect_task(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                if this.inner.healthy.load(Ordering::SeqCst) {
                    return;
                }
                if this.health().await.is_ok() {
                    log::info!("BrokerClient: health check succeeded, leaving degraded mode");
                    return;
                }
            }
        });
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::SeqCst)
    }

    async fn call(&self, request: Request) -> Result<serde_json::Value, BrokerError> {
        if !self.inner.healthy.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable);
        }
        self.call_raw(request).await
    }

    async fn call_raw(&self, request: Request) -> Result<serde_json::Value, BrokerError> {
        let mut guard = self.inner.io.lock().await;
        let io = guard.as_mut().ok_or(BrokerError::Unavailable)?;

        let call = async {
            write_frame(&mut io.stdin, &request).await?;
            let response: Response = read_frame(&mut io.stdout, ENVELOPE_CAP).await?;
            Ok::<Response, FramingError>(response)
        };

        let response = tokio::time::timeout(self.inner.request_timeout, call)
            .await
            .map_err(|_| BrokerError::Transport("request timed out".into()))?
            .map_err(BrokerError::from)?;

        match response {
            Response::Ok { result } => Ok(result),
            Response::Error { message } => Err(BrokerError::Remote(message)),
        }
    }

    pub async fn health(&self) -> Result<(), BrokerError> {
        let result = self.call_raw(Request::Health).await;
        self.inner.healthy.store(result.is_ok(), Ordering::SeqCst);
        result.map(|_| ())
    }

    pub async fn llm_complete(
        &self,
        prompt: &str,
        params: serde_json::Value,
    ) -> Result<String, BrokerError> {
        let result = self
            .call(Request::LlmComplete { prompt: prompt.to_string(), params })
            .await?;
        result
            .get("content")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| BrokerError::Remote("malformed llm_complete response".into()))
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, BrokerError> {
        let result = self.call(Request::Embed { text: text.to_string() }).await?;
        serde_json::from_value(result.get("embedding").cloned().unwrap_or(serde_json::Value::Null))
            .map_err(|_| BrokerError::Remote("malformed embed response".into()))
    }

    pub async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
        let result = self
            .call(Request::SignMessage { message_hex: hex_encode(message) })
            .await?;
        let sig_hex = result
            .get("signature_hex")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BrokerError::Remote("malformed sign_message response".into()))?;
        hex_decode(sig_hex).map_err(|e| Box::new(BrokerError::Remote(e)) as Box<dyn Error + Send + Sync>)
    }

    pub async fn sign_typed_data(
        &self,
        payload: &serde_json::Value,
    ) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
        let result = self.call(Request::SignTypedData { payload: payload.clone() }).await?;
        let sig_hex = result
            .get("signature_hex")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BrokerError::Remote("malformed sign_typed_data response".into()))?;
        hex_decode(sig_hex).map_err(|e| Box::new(BrokerError::Remote(e)) as Box<dyn Error + Send + Sync>)
    }

    pub async fn get_address(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        let result = self.call(Request::GetAddress).await?;
        result
            .get("address")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Box::new(BrokerError::Remote("malformed get_address response".into())) as Box<dyn Error + Send + Sync>)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err("odd-length hex string".to_string());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trips() {
        let bytes = vec![0xde, 0xad, 0xbe, 0xef];
        let encoded = hex_encode(&bytes);
        assert_eq!(encoded, "deadbeef");
        assert_eq!(hex_decode(&encoded).unwrap(), bytes);
    }

    #[test]
    fn hex_decode_rejects_odd_length() {
        assert!(hex_decode("abc").is_err());
    }
}
