//! Completion Client
//!
//! Obtains one raw completion for one vocabulary item. Each worker loop owns a
//! [`ConversationContext`] so successive items reuse the same message history
//! until the reuse limit is hit. Transient failures (network, 429, 503) are
//! retried with the server-suggested delay when one is given.

use crate::config::GenerationConfig;
use crate::error::ApiError;
use crate::provider::{ChatMessage, CompletionTransport};
use crate::types::SessionId;
use crate::vocabulary::VocabularyItem;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry settings for completion calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Wait after a throttled reply with no delay hint
    pub default_delay: Duration,
    /// Wait after a network failure
    pub network_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            default_delay: Duration::from_secs(10),
            network_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            default_delay: Duration::from_millis(config.default_retry_delay_ms),
            network_delay: Duration::from_millis(config.network_retry_delay_ms),
        }
    }

    /// How long to wait before retrying after `err`.
    pub fn delay_for(&self, err: &ApiError) -> Duration {
        match err {
            ApiError::ProviderStatus {
                retry_after, body, ..
            } => retry_delay_from_body(body)
                .or_else(|| retry_after.as_deref().and_then(parse_seconds))
                .unwrap_or(self.default_delay),
            _ => self.network_delay,
        }
    }
}

/// Parse `"2.5s"` or `"2.5"` as seconds.
fn parse_seconds(raw: &str) -> Option<Duration> {
    let trimmed = raw.trim();
    let number = trimmed.strip_suffix('s').unwrap_or(trimmed);
    let seconds: f64 = number.trim().parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(Duration::from_millis((seconds * 1000.0).floor() as u64))
}

/// First `error.details[*].retryDelay` in a JSON error body.
fn retry_delay_from_body(body: &str) -> Option<Duration> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    parsed
        .get("error")?
        .get("details")?
        .as_array()?
        .iter()
        .filter_map(|detail| detail.get("retryDelay").and_then(Value::as_str))
        .find_map(parse_seconds)
}

/// Message history for one (session, slot) pair.
///
/// Created lazily, seeded with the system instruction, and cleared once
/// `reuse_limit` items have been answered under it. Losing it is never an error.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    session_id: SessionId,
    slot: usize,
    messages: Vec<ChatMessage>,
    words_used: usize,
    reuse_limit: usize,
}

impl ConversationContext {
    pub fn new(session_id: impl Into<SessionId>, slot: usize, reuse_limit: usize) -> Self {
        Self {
            session_id: session_id.into(),
            slot,
            messages: Vec::new(),
            words_used: 0,
            reuse_limit: reuse_limit.max(1),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn words_used(&self) -> usize {
        self.words_used
    }

    fn seed(&mut self, system_prompt: &str) {
        if self.messages.is_empty() {
            self.messages.push(ChatMessage::system(system_prompt));
            self.words_used = 0;
        }
    }

    /// Full history to send: prior turns plus the new request.
    fn request_history(&self, user_message: &ChatMessage) -> Vec<ChatMessage> {
        let mut history = Vec::with_capacity(self.messages.len() + 1);
        history.extend_from_slice(&self.messages);
        history.push(user_message.clone());
        history
    }

    fn record_exchange(&mut self, user_message: ChatMessage, reply: &str) {
        self.messages.push(user_message);
        self.messages.push(ChatMessage::assistant(reply));
        self.words_used += 1;
        if self.words_used >= self.reuse_limit {
            debug!(
                session_id = %self.session_id,
                slot = self.slot,
                words_used = self.words_used,
                "Conversation reuse limit reached; starting fresh context"
            );
            self.messages.clear();
            self.words_used = 0;
        }
    }
}

#[derive(Serialize)]
struct UserPrompt<'a> {
    word: &'a str,
    difficulty_score: f64,
    pattern_count: usize,
    meaning_candidates: Vec<String>,
    part_of_speech: Option<&'a str>,
    tag_pool: &'a [String],
}

/// Compact JSON description of one item, sent as the user turn.
pub fn build_user_prompt(item: &VocabularyItem, tag_pool: &[String], pattern_count: usize) -> String {
    let prompt = UserPrompt {
        word: &item.word,
        difficulty_score: item.difficulty_score,
        pattern_count,
        meaning_candidates: item.meanings(),
        part_of_speech: item.part_of_speech.as_deref(),
        tag_pool,
    };
    // Serializing plain strings and numbers cannot fail.
    serde_json::to_string(&prompt).unwrap_or_default()
}

/// Resilient completion access for worker loops
pub struct CompletionClient {
    transport: Arc<dyn CompletionTransport>,
    system_prompt: Arc<str>,
    policy: RetryPolicy,
}

impl CompletionClient {
    pub fn new(
        transport: Arc<dyn CompletionTransport>,
        system_prompt: impl Into<Arc<str>>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            system_prompt: system_prompt.into(),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn model_name(&self) -> &str {
        self.transport.model_name()
    }

    /// Request one completion for `item` under `context`.
    ///
    /// On success the exchange is appended to the context. On failure the
    /// context is left as it was before the call.
    pub async fn generate(
        &self,
        item: &VocabularyItem,
        tag_pool: &[String],
        pattern_count: usize,
        context: &mut ConversationContext,
    ) -> Result<String, ApiError> {
        context.seed(&self.system_prompt);
        let user_message = ChatMessage::user(build_user_prompt(item, tag_pool, pattern_count));
        let history = context.request_history(&user_message);

        let mut attempt = 0usize;
        loop {
            match self.transport.complete(&history).await {
                Ok(reply) => {
                    if reply.trim().is_empty() {
                        return Err(ApiError::ProviderEmptyResponse);
                    }
                    context.record_exchange(user_message, &reply);
                    return Ok(reply);
                }
                Err(err) if err.is_retryable() && attempt < self.policy.max_retries => {
                    let delay = self.policy.delay_for(&err);
                    attempt += 1;
                    warn!(
                        session_id = %context.session_id,
                        slot = context.slot,
                        word_id = item.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Completion request failed; retrying"
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
