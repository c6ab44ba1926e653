//! Operator control plane: pause, resume, parallelism, status and reset.
//!
//! Every operation acts on the persisted session record; running worker loops
//! observe the change on their next status poll.

use crate::controller::GenerationRequest;
use crate::error::ApiError;
use crate::store::{
    meta, record_log, GenerationSession, GeneratorStore, LogLevel, ResetSummary, SessionMetadata,
    SessionStatus,
};
use crate::types::{clamp_parallel, SessionId, WordId};
use crate::vocabulary::VocabularySource;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// Snapshot of the latest session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub status: SessionStatus,
    /// Last word touched, or a placeholder before the first item
    pub note: String,
    pub progress: u64,
    pub total_words: Option<usize>,
    pub failures: usize,
    pub start_word_id: Option<WordId>,
    pub parallel: Option<usize>,
    pub pattern_count: Option<usize>,
    pub updated_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StatusReport {
    Idle,
    Session(SessionSummary),
}

/// What resuming a session amounts to
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeDecision {
    /// A paused session was flipped back to running in place
    Unpaused,
    AlreadyRunning,
    /// Nothing left to generate
    NothingRemaining(String),
    /// The old session was marked failed; start a new one with this request
    Restart {
        previous_session_id: SessionId,
        request: GenerationRequest,
    },
}

pub struct ControlPlane {
    store: Arc<dyn GeneratorStore>,
    vocabulary: Arc<dyn VocabularySource>,
}

impl ControlPlane {
    pub fn new(store: Arc<dyn GeneratorStore>, vocabulary: Arc<dyn VocabularySource>) -> Self {
        Self { store, vocabulary }
    }

    fn require_session(&self, session_id: &str) -> Result<GenerationSession, ApiError> {
        self.store
            .fetch_session(session_id)?
            .ok_or_else(|| ApiError::SessionNotFound(session_id.to_string()))
    }

    fn log(&self, session_id: Option<&str>, message: &str, payload: Value) -> Result<(), ApiError> {
        record_log(
            self.store.as_ref(),
            session_id,
            LogLevel::Info,
            message,
            payload,
        )?;
        Ok(())
    }

    pub fn pause_session(&self, session_id: &str) -> Result<(), ApiError> {
        self.require_session(session_id)?;
        self.store
            .update_status(session_id, SessionStatus::Paused)?;
        self.log(Some(session_id), "session paused by operator", json!({}))
    }

    /// Write a new parallelism target; returns the clamped value.
    pub fn set_session_parallel(&self, session_id: &str, parallel: usize) -> Result<usize, ApiError> {
        self.require_session(session_id)?;
        let normalized = clamp_parallel(parallel);
        self.store.update_parallel(session_id, normalized)?;
        self.log(
            Some(session_id),
            &format!("parallel updated to {}", normalized),
            json!({ "parallel": normalized }),
        )?;
        Ok(normalized)
    }

    fn resume_in_place(
        &self,
        session: &GenerationSession,
    ) -> Result<Option<ResumeDecision>, ApiError> {
        match session.status {
            SessionStatus::Paused => {
                self.store
                    .update_status(&session.id, SessionStatus::Running)?;
                self.log(Some(&session.id), "session resumed by operator", json!({}))?;
                Ok(Some(ResumeDecision::Unpaused))
            }
            SessionStatus::Running => Ok(Some(ResumeDecision::AlreadyRunning)),
            _ => Ok(None),
        }
    }

    /// Resume without restarting: only paused and running sessions qualify.
    pub fn unpause_session(&self, session_id: &str) -> Result<ResumeDecision, ApiError> {
        let session = self.require_session(session_id)?;
        self.resume_in_place(&session)?.ok_or_else(|| {
            ApiError::InvalidRequest(format!(
                "session {} is {} and cannot be restarted while another run holds the store",
                session_id, session.status
            ))
        })
    }

    /// Decide how to resume `session_id`, applying in-place transitions.
    pub fn resume_session(
        &self,
        session_id: &str,
        parallel: Option<usize>,
    ) -> Result<ResumeDecision, ApiError> {
        let session = self.require_session(session_id)?;
        if let Some(decision) = self.resume_in_place(&session)? {
            return Ok(decision);
        }

        let (Some(start), Some(limit)) = (session.start_word_id(), session.limit()) else {
            return Ok(ResumeDecision::NothingRemaining(
                "session has no recorded word range".to_string(),
            ));
        };
        let processed = session.progress as usize;
        if processed >= limit {
            return Ok(ResumeDecision::NothingRemaining(
                "all words already processed".to_string(),
            ));
        }
        let remaining: Vec<WordId> = self
            .vocabulary
            .slice(start, limit)
            .into_iter()
            .skip(processed)
            .map(|item| item.id)
            .collect();
        let Some(&remaining_start) = remaining.first() else {
            return Ok(ResumeDecision::NothingRemaining(
                "no remaining words".to_string(),
            ));
        };
        let parallel = clamp_parallel(parallel.unwrap_or_else(|| session.parallel_target()));

        self.store
            .update_status(session_id, SessionStatus::Failed)?;
        self.log(
            Some(session_id),
            "session interrupted; resuming",
            json!({ "remaining_start_word_id": remaining_start, "remaining": remaining.len() }),
        )?;

        let mut metadata = SessionMetadata::new();
        metadata.insert(
            meta::RESUMED_FROM_SESSION_ID.to_string(),
            Value::from(session.id.clone()),
        );
        Ok(ResumeDecision::Restart {
            previous_session_id: session.id.clone(),
            request: GenerationRequest {
                parallel,
                start_word_id: remaining_start,
                limit: remaining.len(),
                pattern_count: session.pattern_count(),
                resume_existing: false,
                metadata,
            },
        })
    }

    /// Distinct words that errored in the session and never got questions.
    pub fn failure_count(&self, session_id: &str) -> Result<usize, ApiError> {
        let errored: HashSet<WordId> = self
            .store
            .logs_for_session(session_id)?
            .iter()
            .filter(|entry| entry.level == LogLevel::Error)
            .filter_map(|entry| entry.word_id())
            .collect();
        if errored.is_empty() {
            return Ok(0);
        }
        let succeeded: HashSet<WordId> = self
            .store
            .questions_for_session(session_id)?
            .iter()
            .map(|row| row.word_id)
            .collect();
        Ok(errored.difference(&succeeded).count())
    }

    pub fn session_status(&self) -> Result<StatusReport, ApiError> {
        let Some(session) = self.store.fetch_latest_session()? else {
            return Ok(StatusReport::Idle);
        };
        let failures = self.failure_count(&session.id)?;
        Ok(StatusReport::Session(SessionSummary {
            note: session
                .current_word
                .clone()
                .filter(|w| !w.is_empty())
                .unwrap_or_else(|| "No word processed yet".to_string()),
            progress: session.progress,
            total_words: session.limit(),
            failures,
            start_word_id: session.start_word_id(),
            parallel: session.meta_u64(meta::PARALLEL).map(|v| v as usize),
            pattern_count: session.pattern_count(),
            updated_at_ms: session.finished_at_ms.unwrap_or(session.updated_at_ms),
            status: session.status,
            session_id: session.id,
        }))
    }

    /// Delete all questions, logs and sessions, then log the reset.
    pub fn reset_generator_data(&self, reason: Option<&str>) -> Result<ResetSummary, ApiError> {
        match self.store.reset_all() {
            Ok(summary) => {
                self.log(
                    None,
                    "generator data reset",
                    json!({ "reason": reason, "summary": summary }),
                )?;
                Ok(summary)
            }
            Err(err) => {
                if let Err(log_err) = record_log(
                    self.store.as_ref(),
                    None,
                    LogLevel::Error,
                    "generator reset failed",
                    json!({ "reason": reason, "error": err.to_string() }),
                ) {
                    warn!(error = %log_err, reset_error = %err, "Failed to log generator reset failure");
                }
                Err(err.into())
            }
        }
    }
}
