//! Regeneration Queue
//!
//! Operators queue "redo this word" requests; a processing run claims a bounded
//! batch of pending entries, replaces the stored questions for every known word
//! and records the outcome on each entry.

use crate::completion::CompletionClient;
use crate::error::ApiError;
use crate::session::{RuntimeSettings, SessionRuntime};
use crate::store::{
    meta, record_log, GeneratorStore, LogLevel, NewQueueEntry, QueueStatus, QueueStatusUpdate,
    RegenerationQueueEntry, SessionMetadata, SessionStatus,
};
use crate::types::{clamp_pattern_count, QueueEntryId, SessionId, WordId};
use crate::vocabulary::{VocabularyItem, VocabularySource};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Failure text for entries whose word is not in the master list.
pub const MISSING_WORD_REASON: &str = "word is not registered in the vocabulary";

/// Reason recorded when a request carries none.
pub const DEFAULT_REASON: &str = "manual regeneration request";

/// Entries listed when no limit is given
pub const LIST_LIMIT: usize = 100;

/// One incoming queue request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegenerationRequest {
    pub word_id: i64,
    pub word: Option<String>,
    pub reason: Option<String>,
}

/// Result of a processing run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegenerationOutcome {
    /// Entries regenerated, or the entries failed as missing when none were known
    pub processed: usize,
    pub session_id: Option<SessionId>,
}

/// Normalize raw requests: non-positive ids are dropped, blank words become
/// `word{id}`, blank reasons get [`DEFAULT_REASON`].
pub fn normalize_requests(requests: &[RegenerationRequest]) -> Vec<NewQueueEntry> {
    requests
        .iter()
        .filter(|request| request.word_id > 0)
        .map(|request| {
            let word_id = request.word_id as WordId;
            let word = request
                .word
                .as_deref()
                .map(str::trim)
                .filter(|w| !w.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("word{}", word_id));
            let reason = request
                .reason
                .as_deref()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .unwrap_or(DEFAULT_REASON)
                .to_string();
            NewQueueEntry {
                word_id,
                word,
                reason,
            }
        })
        .collect()
}

/// Drives the regeneration queue
pub struct RegenerationProcessor {
    store: Arc<dyn GeneratorStore>,
    vocabulary: Arc<dyn VocabularySource>,
    client: Arc<CompletionClient>,
    settings: RuntimeSettings,
    batch_limit: usize,
}

impl RegenerationProcessor {
    pub fn new(
        store: Arc<dyn GeneratorStore>,
        vocabulary: Arc<dyn VocabularySource>,
        client: Arc<CompletionClient>,
        settings: RuntimeSettings,
        batch_limit: usize,
    ) -> Self {
        Self {
            store,
            vocabulary,
            client,
            settings,
            batch_limit: batch_limit.max(1),
        }
    }

    /// Queue requests. Word ids already pending or processing are dropped, as
    /// are repeats within the same call. Returns the rows inserted.
    pub fn add(
        &self,
        requests: &[RegenerationRequest],
    ) -> Result<Vec<RegenerationQueueEntry>, ApiError> {
        let entries = normalize_requests(requests);
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let inserted = self.store.insert_queue_entries(&entries)?;
        info!(
            requested = requests.len(),
            inserted = inserted.len(),
            "Regeneration requests queued"
        );
        Ok(inserted)
    }

    /// Visible entries, oldest first. `None` lists every status.
    pub fn list(
        &self,
        statuses: Option<&[QueueStatus]>,
    ) -> Result<Vec<RegenerationQueueEntry>, ApiError> {
        let statuses = statuses.unwrap_or(&QueueStatus::ALL);
        Ok(self.store.fetch_queue_entries(statuses, LIST_LIMIT)?)
    }

    pub fn hide(&self, ids: &[QueueEntryId]) -> Result<usize, ApiError> {
        if ids.is_empty() {
            return Err(ApiError::RegenerationFailed(
                "no queue entry ids given".to_string(),
            ));
        }
        Ok(self.store.hide_queue_entries(ids)?)
    }

    /// Claim up to the batch limit of pending entries and regenerate them in one session.
    pub async fn process(
        &self,
        parallel: usize,
        pattern_count: usize,
    ) -> Result<RegenerationOutcome, ApiError> {
        let pending = self
            .store
            .fetch_queue_entries(&[QueueStatus::Pending], self.batch_limit)?;
        if pending.is_empty() {
            return Ok(RegenerationOutcome {
                processed: 0,
                session_id: None,
            });
        }

        let claimed: Vec<QueueEntryId> = pending.iter().map(|e| e.id.clone()).collect();
        self.store.update_queue_entries(
            &claimed,
            &QueueStatusUpdate::status(QueueStatus::Processing),
        )?;

        let mut ready: Vec<(QueueEntryId, VocabularyItem)> = Vec::new();
        let mut missing: Vec<QueueEntryId> = Vec::new();
        for entry in &pending {
            match self.vocabulary.lookup(entry.word_id) {
                Some(item) => ready.push((entry.id.clone(), item)),
                None => missing.push(entry.id.clone()),
            }
        }

        if !missing.is_empty() {
            warn!(count = missing.len(), "Regeneration entries reference unknown words");
            self.store.update_queue_entries(
                &missing,
                &QueueStatusUpdate {
                    status: QueueStatus::Failed,
                    session_id: None,
                    last_error: Some(MISSING_WORD_REASON.to_string()),
                },
            )?;
        }

        if ready.is_empty() {
            return Ok(RegenerationOutcome {
                processed: missing.len(),
                session_id: None,
            });
        }

        let ready_ids: Vec<QueueEntryId> = ready.iter().map(|(id, _)| id.clone()).collect();
        match self.regenerate(ready, parallel, pattern_count).await {
            Ok(session_id) => {
                self.store.update_queue_entries(
                    &ready_ids,
                    &QueueStatusUpdate {
                        status: QueueStatus::Completed,
                        session_id: Some(session_id.clone()),
                        last_error: None,
                    },
                )?;
                Ok(RegenerationOutcome {
                    processed: ready_ids.len(),
                    session_id: Some(session_id),
                })
            }
            Err(err) => {
                self.store.update_queue_entries(
                    &ready_ids,
                    &QueueStatusUpdate {
                        status: QueueStatus::Failed,
                        session_id: None,
                        last_error: Some(err.to_string()),
                    },
                )?;
                Err(err)
            }
        }
    }

    async fn regenerate(
        &self,
        ready: Vec<(QueueEntryId, VocabularyItem)>,
        parallel: usize,
        pattern_count: usize,
    ) -> Result<SessionId, ApiError> {
        let items: Vec<VocabularyItem> = ready.into_iter().map(|(_, item)| item).collect();
        let word_ids: Vec<WordId> = items.iter().map(|item| item.id).collect();

        let removed = self.store.delete_questions_for_words(&word_ids)?;
        record_log(
            self.store.as_ref(),
            None,
            LogLevel::Info,
            "regeneration cleared stored questions",
            json!({ "word_ids": word_ids, "rows_deleted": removed }),
        )?;

        let mut metadata = SessionMetadata::new();
        metadata.insert(
            meta::PATTERN_COUNT.to_string(),
            Value::from(clamp_pattern_count(pattern_count) as u64),
        );
        metadata.insert(meta::REGEN_QUEUE.to_string(), Value::Bool(true));
        metadata.insert(meta::WORD_IDS.to_string(), json!(word_ids));

        let runtime = SessionRuntime::new(
            items,
            metadata,
            Arc::clone(&self.store),
            Arc::clone(&self.client),
            self.settings.clone(),
        );
        runtime.set_parallel_limit(parallel)?;
        let outcome = runtime.start().await?;
        if outcome.status != SessionStatus::Completed {
            // Stored questions were already cleared, so an early stop is a failed run.
            return Err(ApiError::RegenerationFailed(format!(
                "session {} ended {} after {} of {} words",
                outcome.session_id, outcome.status, outcome.processed, outcome.submitted
            )));
        }
        Ok(outcome.session_id)
    }
}
