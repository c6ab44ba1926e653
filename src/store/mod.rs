//! Generator Store
//!
//! Durable records shared by the worker pool, the controller, the regeneration
//! processor and operators: sessions, the per-session log, generated question
//! rows and the regeneration queue.

pub mod persistence;

pub use persistence::SledGeneratorStore;

use crate::error::StorageError;
use crate::parser::QuestionPayload;
use crate::types::{QuestionId, QueueEntryId, SessionId, WordId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Metadata keys written on session records
pub mod meta {
    pub const START_WORD_ID: &str = "start_word_id";
    pub const LIMIT: &str = "limit";
    pub const PATTERN_COUNT: &str = "pattern_count";
    pub const PARALLEL: &str = "parallel";
    pub const RESUMED_FROM_SESSION_ID: &str = "resumed_from_session_id";
    pub const RESUME_START_WORD_ID: &str = "resume_start_word_id";
    pub const RESUME_SOURCE_START_WORD_ID: &str = "resume_source_start_word_id";
    pub const RESUME_SOURCE_LIMIT: &str = "resume_source_limit";
    pub const REGEN_QUEUE: &str = "regen_queue";
    pub const WORD_IDS: &str = "word_ids";
}

/// Free-form session metadata
pub type SessionMetadata = Map<String, Value>;

/// Generation session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One orchestrator run over a bounded slice of vocabulary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSession {
    pub id: SessionId,
    pub status: SessionStatus,
    /// Parallelism requested at creation
    pub parallel: usize,
    /// Live parallelism target written by operators
    #[serde(default)]
    pub parallel_slot: Option<usize>,
    #[serde(default)]
    pub current_word: Option<String>,
    #[serde(default)]
    pub progress: u64,
    #[serde(default)]
    pub metadata: SessionMetadata,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    #[serde(default)]
    pub finished_at_ms: Option<u64>,
    /// Store-assigned creation sequence, breaks created_at ties
    #[serde(default)]
    pub created_seq: u64,
}

impl GenerationSession {
    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        match self.metadata.get(key)? {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn meta_bool(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn start_word_id(&self) -> Option<WordId> {
        self.meta_u64(meta::START_WORD_ID)
    }

    pub fn limit(&self) -> Option<usize> {
        self.meta_u64(meta::LIMIT).map(|v| v as usize)
    }

    pub fn pattern_count(&self) -> Option<usize> {
        self.meta_u64(meta::PATTERN_COUNT).map(|v| v as usize)
    }

    /// Current parallelism target: `metadata.parallel`, else the creation value.
    pub fn parallel_target(&self) -> usize {
        self.meta_u64(meta::PARALLEL)
            .map(|v| v as usize)
            .filter(|v| *v > 0)
            .unwrap_or(self.parallel)
    }
}

/// Durable log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One durable log line, optionally tied to a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLogEntry {
    pub seq: u64,
    pub session_id: Option<SessionId>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub payload: Value,
    pub created_at_ms: u64,
}

impl SessionLogEntry {
    /// Word id carried in the payload, if any.
    pub fn word_id(&self) -> Option<WordId> {
        self.payload.get("word_id").and_then(Value::as_u64)
    }
}

/// One persisted question, tagged with its session and source word
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedQuestionRow {
    pub session_id: SessionId,
    pub word_id: WordId,
    pub word: String,
    pub pattern_number: u32,
    pub question: QuestionPayload,
    pub created_at_ms: u64,
}

/// A question row addressed by its store key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredQuestion {
    pub id: QuestionId,
    #[serde(flatten)]
    pub row: GeneratedQuestionRow,
}

/// Regeneration queue entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 4] = [
        QueueStatus::Pending,
        QueueStatus::Processing,
        QueueStatus::Completed,
        QueueStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, QueueStatus::Pending | QueueStatus::Processing)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(format!("unknown queue status: {}", other)),
        }
    }
}

/// A "redo this word" request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegenerationQueueEntry {
    pub id: QueueEntryId,
    pub word_id: WordId,
    pub word: String,
    pub reason: String,
    pub status: QueueStatus,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    #[serde(default)]
    pub created_seq: u64,
}

/// Insert request for the regeneration queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewQueueEntry {
    pub word_id: WordId,
    pub word: String,
    pub reason: String,
}

/// Status transition applied to a set of queue entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatusUpdate {
    pub status: QueueStatus,
    pub session_id: Option<SessionId>,
    pub last_error: Option<String>,
}

impl QueueStatusUpdate {
    pub fn status(status: QueueStatus) -> Self {
        Self {
            status,
            session_id: None,
            last_error: None,
        }
    }
}

/// Row counts removed by a full reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResetSummary {
    pub questions_deleted: usize,
    pub logs_deleted: usize,
    pub sessions_deleted: usize,
}

/// Write a durable log line and mirror it to process logging.
pub fn record_log(
    store: &dyn GeneratorStore,
    session_id: Option<&str>,
    level: LogLevel,
    message: &str,
    payload: Value,
) -> Result<(), StorageError> {
    let session = session_id.unwrap_or("-");
    match level {
        LogLevel::Info => tracing::info!(session_id = session, %payload, "{}", message),
        LogLevel::Warn => tracing::warn!(session_id = session, %payload, "{}", message),
        LogLevel::Error => tracing::error!(session_id = session, %payload, "{}", message),
    }
    store.log(session_id, level, message, payload)
}

/// Persistence interface used by the orchestrator
pub trait GeneratorStore: Send + Sync {
    /// Create a session in `pending` state with a fresh id.
    fn create_session(
        &self,
        parallel: usize,
        metadata: SessionMetadata,
    ) -> Result<GenerationSession, StorageError>;

    /// Set status; `finished_at_ms` is stamped for terminal states and cleared otherwise.
    fn update_status(&self, session_id: &str, status: SessionStatus) -> Result<(), StorageError>;

    /// Record progress and the last word touched. Stored progress never decreases.
    fn update_progress(
        &self,
        session_id: &str,
        progress: u64,
        current_word: &str,
    ) -> Result<(), StorageError>;

    /// Write the live parallelism target (`metadata.parallel` and `parallel_slot`).
    fn update_parallel(&self, session_id: &str, parallel: usize) -> Result<(), StorageError>;

    fn fetch_session(&self, session_id: &str) -> Result<Option<GenerationSession>, StorageError>;

    /// Most recently created session.
    fn fetch_latest_session(&self) -> Result<Option<GenerationSession>, StorageError>;

    fn insert_question(&self, row: &GeneratedQuestionRow) -> Result<(), StorageError>;

    fn questions_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<GeneratedQuestionRow>, StorageError>;

    fn questions_for_word(&self, word_id: WordId)
        -> Result<Vec<GeneratedQuestionRow>, StorageError>;

    /// Delete every question row for the given words; returns rows removed.
    fn delete_questions_for_words(&self, word_ids: &[WordId]) -> Result<usize, StorageError>;

    /// Every question row with its id, ordered by word id then insertion.
    fn all_questions(&self) -> Result<Vec<StoredQuestion>, StorageError>;

    /// Rows for the given ids in request order. Unknown ids are skipped.
    fn questions_by_ids(&self, ids: &[QuestionId]) -> Result<Vec<StoredQuestion>, StorageError>;

    /// Overwrite an existing row. Returns false when the id is unknown.
    fn update_question(
        &self,
        id: &str,
        row: &GeneratedQuestionRow,
    ) -> Result<bool, StorageError>;

    fn log(
        &self,
        session_id: Option<&str>,
        level: LogLevel,
        message: &str,
        payload: Value,
    ) -> Result<(), StorageError>;

    /// Log lines for one session, oldest first.
    fn logs_for_session(&self, session_id: &str) -> Result<Vec<SessionLogEntry>, StorageError>;

    /// Delete all question rows, logs and sessions. The queue is kept.
    fn reset_all(&self) -> Result<ResetSummary, StorageError>;

    /// Insert pending entries, dropping word ids already pending or processing.
    /// Returns the rows actually inserted.
    fn insert_queue_entries(
        &self,
        entries: &[NewQueueEntry],
    ) -> Result<Vec<RegenerationQueueEntry>, StorageError>;

    /// Visible entries in the given statuses, oldest first, at most `limit`.
    fn fetch_queue_entries(
        &self,
        statuses: &[QueueStatus],
        limit: usize,
    ) -> Result<Vec<RegenerationQueueEntry>, StorageError>;

    fn update_queue_entries(
        &self,
        ids: &[QueueEntryId],
        update: &QueueStatusUpdate,
    ) -> Result<(), StorageError>;

    /// Mark entries hidden; returns how many existed.
    fn hide_queue_entries(&self, ids: &[QueueEntryId]) -> Result<usize, StorageError>;
}
