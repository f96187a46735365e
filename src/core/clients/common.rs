//! Shared utilities backing the OpenAI client used by the secrets broker.
//!
//! Provides a tuned, pooled [`reqwest::Client`] plus the native-tool-calling
//! request/response plumbing shared by [`crate::core::clients::openai`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio::sync::Mutex;
//! use agentcore::core::client_wrapper::{Message, Role, ToolDefinition};
//! use agentcore::core::clients::common::{get_shared_http_client, send_with_native_tools};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let usage = Mutex::new(None);
//! let msg = Message { role: Role::User, content: Arc::from("hi"), tool_calls: vec![] };
//! let reply = send_with_native_tools(
//!     "https://api.openai.com/v1",
//!     &std::env::var("OPEN_AI_SECRET")?,
//!     "gpt-4.1-nano",
//!     &[msg],
//!     &[],
//!     get_shared_http_client(),
//!     &usage,
//! ).await?;
//! println!("{}", reply.content);
//! # Ok(())
//! # }
//! ```

use crate::core::client_wrapper::{Message, MessageChunk, NativeToolCall, Role, TokenUsage, ToolDefinition};
use lazy_static::lazy_static;
use openai_rust2 as openai_rust;
use std::error::Error;
use std::time::Duration;
use tokio::sync::Mutex;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// The single client instance keeps TLS sessions and DNS lookups warm which significantly
    /// reduces latency when many concurrent requests are issued to upstream providers.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
///
/// The returned reference can be cloned and reused by individual client wrappers.
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Send a plain (no native tools) chat completion through the `openai-rust2`
/// SDK client and persist token usage. Used for the common case; calls that
/// carry [`ToolDefinition`]s go through [`send_with_native_tools`] instead,
/// since the SDK's `ChatArguments` has no native tool-calling support.
pub async fn send_and_track(
    api: &openai_rust::Client,
    model: &str,
    messages: &[Message],
    usage_slot: &Mutex<Option<TokenUsage>>,
) -> Result<Message, Box<dyn Error>> {
    let formatted: Vec<openai_rust::chat::Message> = messages
        .iter()
        .map(|msg| openai_rust::chat::Message {
            role: match &msg.role {
                Role::System => "system".to_owned(),
                Role::User => "user".to_owned(),
                Role::Assistant => "assistant".to_owned(),
                Role::Tool { .. } => "tool".to_owned(),
            },
            content: msg.content.to_string(),
        })
        .collect();

    let chat_arguments = openai_rust::chat::ChatArguments::new(model, formatted);

    let response = api
        .create_chat(chat_arguments, Some("/chat/completions".to_string()))
        .await;

    match response {
        Ok(response) => {
            let usage = TokenUsage {
                input_tokens: response.usage.prompt_tokens as usize,
                output_tokens: response.usage.completion_tokens as usize,
                total_tokens: response.usage.total_tokens as usize,
            };
            *usage_slot.lock().await = Some(usage);
            Ok(Message {
                role: Role::Assistant,
                content: std::sync::Arc::from(response.choices[0].message.content.as_str()),
                tool_calls: vec![],
            })
        }
        Err(err) => {
            if log::log_enabled!(log::Level::Error) {
                log::error!("clients::common::send_and_track(...): OpenAI API error: {}", err);
            }
            Err(err.into())
        }
    }
}

/// Call the OpenAI-compatible Chat Completions endpoint with native tool definitions.
///
/// Posts to `{base_url}/chat/completions` with an `Authorization: Bearer {api_key}` header.
/// The response is parsed to extract the assistant content string and any tool calls the model
/// requested.  Token usage is persisted in `usage_slot` so callers can retrieve it via
/// [`ClientWrapper::get_last_usage`](crate::core::client_wrapper::ClientWrapper::get_last_usage).
///
/// # Message serialisation
///
/// | [`Role`] variant | Wire representation |
/// |---|---|
/// | `System` | `{"role":"system","content":"..."}` |
/// | `User` | `{"role":"user","content":"..."}` |
/// | `Assistant` with tool_calls | `{"role":"assistant","content":null,"tool_calls":[...]}` |
/// | `Assistant` without tool_calls | `{"role":"assistant","content":"..."}` |
/// | `Tool { call_id }` | `{"role":"tool","tool_call_id":"<id>","content":"..."}` |
pub async fn send_with_native_tools(
    base_url: &str,
    api_key: &str,
    model: &str,
    messages: &[Message],
    tools: &[ToolDefinition],
    http_client: &reqwest::Client,
    usage_slot: &Mutex<Option<TokenUsage>>,
) -> Result<Message, Box<dyn Error>> {
    let wire_messages: Vec<serde_json::Value> = messages
        .iter()
        .map(|msg| match &msg.role {
            Role::System => serde_json::json!({
                "role": "system",
                "content": msg.content.as_ref()
            }),
            Role::User => serde_json::json!({
                "role": "user",
                "content": msg.content.as_ref()
            }),
            Role::Assistant => {
                if msg.tool_calls.is_empty() {
                    serde_json::json!({
                        "role": "assistant",
                        "content": msg.content.as_ref()
                    })
                } else {
                    let tool_calls: Vec<serde_json::Value> = msg
                        .tool_calls
                        .iter()
                        .map(|tc| serde_json::json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": serde_json::to_string(&tc.arguments)
                                    .unwrap_or_else(|_| "{}".to_string())
                            }
                        }))
                        .collect();
                    serde_json::json!({
                        "role": "assistant",
                        "content": serde_json::Value::Null,
                        "tool_calls": tool_calls
                    })
                }
            }
            Role::Tool { call_id } => serde_json::json!({
                "role": "tool",
                "tool_call_id": call_id,
                "content": msg.content.as_ref()
            }),
        })
        .collect();

    let wire_tools: Vec<serde_json::Value> = tools
        .iter()
        .map(|t| serde_json::json!({
            "type": "function",
            "function": {
                "name": t.name,
                "description": t.description,
                "parameters": t.parameters_schema
            }
        }))
        .collect();

    let mut body = serde_json::json!({
        "model": model,
        "messages": wire_messages,
    });
    if !wire_tools.is_empty() {
        body["tools"] = serde_json::Value::Array(wire_tools);
    }

    let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));

    let resp = http_client
        .post(&url)
        .header("Authorization", format!("Bearer {}", api_key))
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|e| -> Box<dyn Error> { Box::new(e) })?;

    let status = resp.status();
    let text = resp.text().await.map_err(|e| -> Box<dyn Error> { Box::new(e) })?;

    if !status.is_success() {
        if log::log_enabled!(log::Level::Error) {
            log::error!("send_with_native_tools: HTTP {} from {}: {}", status, url, text);
        }
        return Err(format!("send_with_native_tools: HTTP {} — {}", status, text).into());
    }

    let parsed: serde_json::Value =
        serde_json::from_str(&text).map_err(|e| -> Box<dyn Error> { Box::new(e) })?;

    if let Some(usage_obj) = parsed.get("usage") {
        let input = usage_obj.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let output = usage_obj.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        *usage_slot.lock().await = Some(TokenUsage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
        });
    }

    let choice_msg = parsed
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| -> Box<dyn Error> { "send_with_native_tools: no choices in response".into() })?;

    let content: std::sync::Arc<str> = choice_msg
        .get("content")
        .and_then(|c| c.as_str())
        .map(std::sync::Arc::from)
        .unwrap_or_else(|| std::sync::Arc::from(""));

    let tool_calls: Vec<NativeToolCall> = choice_msg
        .get("tool_calls")
        .and_then(|tc| tc.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let id = tc.get("id")?.as_str()?.to_string();
                    let func = tc.get("function")?;
                    let name = func.get("name")?.as_str()?.to_string();
                    let args_str = func.get("arguments")?.as_str().unwrap_or("{}");
                    let arguments: serde_json::Value = serde_json::from_str(args_str)
                        .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
                    Some(NativeToolCall { id, name, arguments })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Message { role: Role::Assistant, content, tool_calls })
}

/// Thin error wrapper used when streaming responses fail mid-flight.
#[derive(Debug, Clone)]
pub struct StreamError(pub String);

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for StreamError {}

/// Convert eagerly collected message chunks into a boxed stream suitable for
/// [`ClientWrapper`](crate::core::client_wrapper::ClientWrapper) implementations.
pub fn chunks_to_stream(
    chunks: Vec<Result<MessageChunk, Box<dyn Error + Send>>>,
) -> crate::core::client_wrapper::MessageChunkStream {
    let stream = futures_util::stream::iter(
        chunks.into_iter().map(|r| r.map_err(|e| e as Box<dyn Error>)),
    );
    Box::pin(stream)
}
