//! Completion Service Transport
//!
//! HTTP access to an OpenAI-compatible chat completion endpoint. The transport
//! performs exactly one request per call; retry and conversation handling live
//! in [`crate::completion`].

use crate::error::ApiError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Fallback system instruction when no prompt file is configured or readable.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You write English vocabulary quiz questions for Japanese learners. \
The user message is a JSON object describing one word. Reply with only a JSON array containing exactly \
pattern_count objects. Each object has: word, pattern_number, sentence_en, sentence_ja, choice_1, choice_2, \
choice_3, choice_4, correct_choice_index (1-4), feedback_1, feedback_2, feedback_3, feedback_4, tags \
(comma separated, chosen from tag_pool), usage_scene, embedding_text.";

/// Completion service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Service root; requests go to `{base_url}/v1/chat/completions`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Bearer token; falls back to `OPENAI_API_KEY` when unset
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub max_completion_tokens: Option<u32>,

    /// Items processed under one conversation before it is discarded
    #[serde(default = "default_conversation_word_limit")]
    pub conversation_word_limit: usize,

    /// File holding the fixed system instruction
    #[serde(default)]
    pub system_prompt_path: Option<PathBuf>,
}

fn default_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_model() -> String {
    "gpt-5-mini".to_string()
}

fn default_conversation_word_limit() -> usize {
    10
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            max_completion_tokens: None,
            conversation_word_limit: default_conversation_word_limit(),
            system_prompt_path: None,
        }
    }
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("Model name cannot be empty".to_string());
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(format!(
                "base_url must start with http:// or https://: {}",
                self.base_url
            ));
        }
        Ok(())
    }

    /// Configured key, else `OPENAI_API_KEY`. Blank values count as missing.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|key| !key.trim().is_empty())
    }

    /// A non-positive limit falls back to the default.
    pub fn effective_word_limit(&self) -> usize {
        if self.conversation_word_limit == 0 {
            default_conversation_word_limit()
        } else {
            self.conversation_word_limit
        }
    }

    /// Read the system instruction once. Missing or empty files fall back to
    /// [`DEFAULT_SYSTEM_PROMPT`].
    pub fn load_system_prompt(&self, workspace_root: &Path) -> String {
        let Some(path) = &self.system_prompt_path else {
            return DEFAULT_SYSTEM_PROMPT.to_string();
        };
        let path = if path.is_absolute() {
            path.clone()
        } else {
            workspace_root.join(path)
        };
        match std::fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                tracing::warn!(path = %path.display(), "System prompt file is empty; using built-in prompt");
                DEFAULT_SYSTEM_PROMPT.to_string()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "System prompt file unreadable; using built-in prompt");
                DEFAULT_SYSTEM_PROMPT.to_string()
            }
        }
    }
}

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// One request/response exchange with the completion service.
///
/// Errors must be classified so that [`ApiError::is_retryable`] holds: network
/// failures as `ProviderRequestFailed`, non-2xx replies as `ProviderStatus`.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    /// Send the full message history and return the reply text.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ApiError>;

    fn model_name(&self) -> &str;
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

fn map_http_error(error: reqwest::Error) -> ApiError {
    if error.is_timeout() {
        ApiError::ProviderRequestFailed(format!("Request timeout: {}", error))
    } else if error.is_connect() {
        ApiError::ProviderRequestFailed(format!("Connection error: {}", error))
    } else {
        ApiError::ProviderRequestFailed(format!("HTTP error: {}", error))
    }
}

const PROVIDER_HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PROVIDER_HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

fn build_provider_http_client() -> Result<Client, ApiError> {
    Client::builder()
        .connect_timeout(PROVIDER_HTTP_CONNECT_TIMEOUT)
        .timeout(PROVIDER_HTTP_REQUEST_TIMEOUT)
        .build()
        .map_err(|e| ApiError::ConfigError(format!("Failed to create HTTP client: {}", e)))
}

/// OpenAI-compatible chat completion client
pub struct OpenAIClient {
    client: Client,
    model: String,
    api_key: Option<String>,
    endpoint: String,
    max_completion_tokens: Option<u32>,
}

impl OpenAIClient {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: &str,
        max_completion_tokens: Option<u32>,
    ) -> Result<Self, ApiError> {
        let client = build_provider_http_client()?;
        let endpoint = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            model,
            api_key,
            endpoint,
            max_completion_tokens,
        })
    }

    pub fn from_config(config: &ProviderConfig) -> Result<Self, ApiError> {
        Self::new(
            config.model.clone(),
            config.resolve_api_key(),
            &config.base_url,
            config.max_completion_tokens,
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CompletionTransport for OpenAIClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ApiError> {
        // Checked per call: a missing key fails each item rather than the process.
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            ApiError::ProviderNotConfigured("completion service API key is not set".to_string())
        })?;

        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            max_completion_tokens: self.max_completion_tokens,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(map_http_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "no response body".to_string());
            return Err(ApiError::ProviderStatus {
                status: status.as_u16(),
                retry_after,
                body,
            });
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(ApiError::ProviderEmptyResponse);
        }
        Ok(content)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
