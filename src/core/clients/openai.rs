//! OpenAI Chat Completions client, the backing implementation for the secrets
//! broker's `llm_complete` operation.
//!
//! Captures per-call token usage in a shared slot so callers can inspect
//! accounting via [`ClientWrapper::get_last_usage`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use agentcore::core::clients::openai::{OpenAIClient, Model};
//! use agentcore::core::client_wrapper::{ClientWrapper, Message, Role};
//!
//! #[tokio::main]
//! async fn main() {
//!     let secret_key: String = std::env::var("OPEN_AI_SECRET").expect("OPEN_AI_SECRET not set");
//!     let client = OpenAIClient::new_with_model_enum(&secret_key, Model::GPT41Nano);
//!
//!     let resp = client.send_message(&[
//!         Message { role: Role::System, content: Arc::from("You are an assistant."), tool_calls: vec![] },
//!         Message { role: Role::User,   content: Arc::from("Hello!"), tool_calls: vec![] },
//!     ], None).await.unwrap();
//!     println!("Assistant: {}", resp.content);
//!
//!     if let Some(usage) = client.get_last_usage().await {
//!         println!("Tokens — input: {}, output: {}, total: {}", usage.input_tokens, usage.output_tokens, usage.total_tokens);
//!     }
//! }
//! ```

use std::error::Error;

use async_trait::async_trait;
use openai_rust2 as openai_rust;

use crate::core::client_wrapper::{ClientWrapper, Message, TokenUsage, ToolDefinition};
use crate::core::clients::common::{get_shared_http_client, send_and_track, send_with_native_tools};

/// Official model identifiers supported by OpenAI's Chat Completions API.
#[allow(non_camel_case_types)]
pub enum Model {
    /// `gpt-5.2` – complex reasoning, broad world knowledge, code-heavy or multi-step agentic tasks.
    GPT52,
    /// `gpt-5.1` – flagship for coding and agentic tasks with configurable reasoning effort.
    GPT51,
    /// `gpt-5` – high-reasoning, medium latency, text or multimodal input.
    GPT5,
    /// `gpt-5-mini` – fast variant of GPT-5 with balanced cost and quality.
    GPT5Mini,
    /// `gpt-5-nano` – lowest latency GPT-5 configuration.
    GPT5Nano,
    /// `gpt-4o` – omni model with text + image inputs.
    GPT4o,
    /// `gpt-4o-mini` – cost effective GPT-4o derivative.
    GPT4oMini,
    /// `gpt-4.1` – general availability GPT-4.1.
    GPT41,
    /// `gpt-4.1-mini` – reduced cost GPT-4.1 tier.
    GPT41Mini,
    /// `gpt-4.1-nano` – ultra low cost GPT-4.1 derivative, the default for sub-agent workloads.
    GPT41Nano,
}

/// Convert a [`Model`] variant into the string identifier expected by the REST API.
pub fn model_to_string(model: Model) -> String {
    match model {
        Model::GPT52 => "gpt-5.2".to_string(),
        Model::GPT51 => "gpt-5.1".to_string(),
        Model::GPT5 => "gpt-5".to_string(),
        Model::GPT5Mini => "gpt-5-mini".to_string(),
        Model::GPT5Nano => "gpt-5-nano".to_string(),
        Model::GPT4o => "gpt-4o".to_string(),
        Model::GPT4oMini => "gpt-4o-mini".to_string(),
        Model::GPT41 => "gpt-4.1".to_string(),
        Model::GPT41Mini => "gpt-4.1-mini".to_string(),
        Model::GPT41Nano => "gpt-4.1-nano".to_string(),
    }
}

/// Client wrapper for OpenAI's Chat Completions API.
///
/// Maintains the selected model identifier plus an internal [`TokenUsage`]
/// slot so callers can inspect how many tokens each request consumed. Reuses
/// the shared HTTP client from [`crate::core::clients::common`].
pub struct OpenAIClient {
    client: openai_rust::Client,
    model: String,
    token_usage: tokio::sync::Mutex<Option<TokenUsage>>,
    api_key: String,
    base_url: String,
}

impl OpenAIClient {
    /// Construct a new client using the provided API key and [`Model`] variant.
    pub fn new_with_model_enum(secret_key: &str, model: Model) -> Self {
        Self::new_with_model_string(secret_key, &model_to_string(model))
    }

    /// Construct a new client using the provided API key and explicit model name.
    ///
    /// General-purpose constructor for unofficial model identifiers (e.g.
    /// OpenAI-compatible self-hosted deployments).
    pub fn new_with_model_string(secret_key: &str, model_name: &str) -> Self {
        OpenAIClient {
            client: openai_rust::Client::new_with_client(secret_key, get_shared_http_client().clone()),
            model: model_name.to_string(),
            token_usage: tokio::sync::Mutex::new(None),
            api_key: secret_key.to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    /// Construct a client targeting a custom OpenAI-compatible base URL.
    /// `base_url` should not have a trailing slash (e.g. `"https://api.openai.com/v1"`).
    pub fn new_with_base_url(secret_key: &str, model_name: &str, base_url: &str) -> Self {
        let base_url_normalized = base_url.trim_end_matches('/');
        OpenAIClient {
            client: openai_rust::Client::new_with_client_and_base_url(
                secret_key,
                get_shared_http_client().clone(),
                &format!("{}/", base_url_normalized),
            ),
            model: model_name.to_string(),
            token_usage: tokio::sync::Mutex::new(None),
            api_key: secret_key.to_string(),
            base_url: base_url_normalized.to_string(),
        }
    }
}

#[async_trait]
impl ClientWrapper for OpenAIClient {
    async fn send_message(
        &self,
        messages: &[Message],
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<Message, Box<dyn Error>> {
        let result = match tools {
            Some(tools) if !tools.is_empty() => {
                send_with_native_tools(
                    &self.base_url,
                    &self.api_key,
                    &self.model,
                    messages,
                    &tools,
                    get_shared_http_client(),
                    &self.token_usage,
                )
                .await
            }
            _ => send_and_track(&self.client, &self.model, messages, &self.token_usage).await,
        };

        if let Err(e) = &result {
            if log::log_enabled!(log::Level::Error) {
                log::error!("OpenAIClient::send_message(...): OpenAI API error: {}", e);
            }
        }
        result
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn usage_slot(&self) -> Option<&tokio::sync::Mutex<Option<TokenUsage>>> {
        Some(&self.token_usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_names_match_api_identifiers() {
        assert_eq!(model_to_string(Model::GPT41Nano), "gpt-4.1-nano");
        assert_eq!(model_to_string(Model::GPT5), "gpt-5");
    }

    #[test]
    fn base_url_trims_trailing_slash() {
        let client = OpenAIClient::new_with_base_url("key", "gpt-4.1-nano", "https://example.com/v1/");
        assert_eq!(client.base_url, "https://example.com/v1");
    }
}
