//! Shared test utilities for integration tests
//!
//! A scripted completion transport, a store wrapper that can refuse writes for
//! one word, and a harness wiring both into a `GeneratorApi` over a temp sled db.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;
use vocabgen::api::GeneratorApi;
use vocabgen::completion::{CompletionClient, RetryPolicy};
use vocabgen::error::{ApiError, StorageError};
use vocabgen::provider::{ChatMessage, CompletionTransport};
use vocabgen::session::RuntimeSettings;
use vocabgen::store::{
    GeneratedQuestionRow, GenerationSession, GeneratorStore, LogLevel, NewQueueEntry, QueueStatus,
    QueueStatusUpdate, RegenerationQueueEntry, ResetSummary, SessionLogEntry, SessionMetadata,
    SessionStatus, SledGeneratorStore, StoredQuestion,
};
use vocabgen::types::{QuestionId, QueueEntryId, WordId};
use vocabgen::vocabulary::{JsonVocabulary, VocabularyItem};

/// What the fake service answers for one request
#[derive(Debug, Clone)]
pub enum Reply {
    /// A valid array with as many questions as the prompt asked for
    Questions,
    /// Text with no JSON array in it
    Prose,
    Status(u16, String),
    Network,
}

/// Completion transport answering from per-word scripts, defaulting to valid questions.
pub struct FakeTransport {
    delay: Duration,
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<String>>,
    call_starts: Mutex<Vec<Instant>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            call_starts: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Replies for successive requests about `word`; afterwards `Questions`.
    pub fn script(&self, word: &str, replies: Vec<Reply>) {
        self.scripts.lock().insert(word.to_string(), replies.into());
    }

    /// Words requested, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Tokio clock reading at the start of each request, in call order.
    pub fn call_starts(&self) -> Vec<Instant> {
        self.call_starts.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

pub fn question_array(word: &str, count: usize) -> String {
    let questions: Vec<Value> = (1..=count)
        .map(|n| {
            json!({
                "word": word,
                "pattern_number": n,
                "sentence_en": format!("Sentence {} for {}", n, word),
                "sentence_ja": "例文",
                "choice_1": "alpha",
                "choice_2": "beta",
                "choice_3": "gamma",
                "choice_4": "delta",
                "correct_choice_index": 1,
                "feedback_1": "correct",
                "tags": "daily_life"
            })
        })
        .collect();
    Value::Array(questions).to_string()
}

#[async_trait]
impl CompletionTransport for FakeTransport {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ApiError> {
        let prompt: Value = messages
            .last()
            .and_then(|m| serde_json::from_str(&m.content).ok())
            .unwrap_or(Value::Null);
        let word = prompt["word"].as_str().unwrap_or_default().to_string();
        let count = prompt["pattern_count"].as_u64().unwrap_or(1) as usize;
        self.calls.lock().push(word.clone());
        self.call_starts.lock().push(Instant::now());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let reply = self
            .scripts
            .lock()
            .get_mut(&word)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Reply::Questions);
        match reply {
            Reply::Questions => Ok(format!("```json\n{}\n```", question_array(&word, count))),
            Reply::Prose => Ok("Sorry, I cannot produce that.".to_string()),
            Reply::Status(status, body) => Err(ApiError::ProviderStatus {
                status,
                retry_after: None,
                body,
            }),
            Reply::Network => Err(ApiError::ProviderRequestFailed("connection reset".to_string())),
        }
    }

    fn model_name(&self) -> &str {
        "fake"
    }
}

/// Sled store that refuses question inserts for one word, and optionally
/// fails resets together with session-less log writes.
pub struct PoisonedStore {
    inner: SledGeneratorStore,
    poisoned_word: String,
    broken_reset: bool,
}

impl PoisonedStore {
    pub fn new(inner: SledGeneratorStore, poisoned_word: &str) -> Self {
        Self {
            inner,
            poisoned_word: poisoned_word.to_string(),
            broken_reset: false,
        }
    }

    pub fn with_broken_reset(mut self) -> Self {
        self.broken_reset = true;
        self
    }
}

impl GeneratorStore for PoisonedStore {
    fn create_session(
        &self,
        parallel: usize,
        metadata: SessionMetadata,
    ) -> Result<GenerationSession, StorageError> {
        self.inner.create_session(parallel, metadata)
    }

    fn update_status(&self, session_id: &str, status: SessionStatus) -> Result<(), StorageError> {
        self.inner.update_status(session_id, status)
    }

    fn update_progress(
        &self,
        session_id: &str,
        progress: u64,
        current_word: &str,
    ) -> Result<(), StorageError> {
        self.inner.update_progress(session_id, progress, current_word)
    }

    fn update_parallel(&self, session_id: &str, parallel: usize) -> Result<(), StorageError> {
        self.inner.update_parallel(session_id, parallel)
    }

    fn fetch_session(&self, session_id: &str) -> Result<Option<GenerationSession>, StorageError> {
        self.inner.fetch_session(session_id)
    }

    fn fetch_latest_session(&self) -> Result<Option<GenerationSession>, StorageError> {
        self.inner.fetch_latest_session()
    }

    fn insert_question(&self, row: &GeneratedQuestionRow) -> Result<(), StorageError> {
        if row.word == self.poisoned_word {
            return Err(StorageError::DataError(format!(
                "disk full while writing {}",
                row.word
            )));
        }
        self.inner.insert_question(row)
    }

    fn questions_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<GeneratedQuestionRow>, StorageError> {
        self.inner.questions_for_session(session_id)
    }

    fn questions_for_word(
        &self,
        word_id: WordId,
    ) -> Result<Vec<GeneratedQuestionRow>, StorageError> {
        self.inner.questions_for_word(word_id)
    }

    fn delete_questions_for_words(&self, word_ids: &[WordId]) -> Result<usize, StorageError> {
        self.inner.delete_questions_for_words(word_ids)
    }

    fn all_questions(&self) -> Result<Vec<StoredQuestion>, StorageError> {
        self.inner.all_questions()
    }

    fn questions_by_ids(&self, ids: &[QuestionId]) -> Result<Vec<StoredQuestion>, StorageError> {
        self.inner.questions_by_ids(ids)
    }

    fn update_question(
        &self,
        id: &str,
        row: &GeneratedQuestionRow,
    ) -> Result<bool, StorageError> {
        self.inner.update_question(id, row)
    }

    fn log(
        &self,
        session_id: Option<&str>,
        level: LogLevel,
        message: &str,
        payload: Value,
    ) -> Result<(), StorageError> {
        if self.broken_reset && session_id.is_none() {
            return Err(StorageError::DataError("log tree unavailable".to_string()));
        }
        self.inner.log(session_id, level, message, payload)
    }

    fn logs_for_session(&self, session_id: &str) -> Result<Vec<SessionLogEntry>, StorageError> {
        self.inner.logs_for_session(session_id)
    }

    fn reset_all(&self) -> Result<ResetSummary, StorageError> {
        if self.broken_reset {
            return Err(StorageError::DataError("reset interrupted".to_string()));
        }
        self.inner.reset_all()
    }

    fn insert_queue_entries(
        &self,
        entries: &[NewQueueEntry],
    ) -> Result<Vec<RegenerationQueueEntry>, StorageError> {
        self.inner.insert_queue_entries(entries)
    }

    fn fetch_queue_entries(
        &self,
        statuses: &[QueueStatus],
        limit: usize,
    ) -> Result<Vec<RegenerationQueueEntry>, StorageError> {
        self.inner.fetch_queue_entries(statuses, limit)
    }

    fn update_queue_entries(
        &self,
        ids: &[QueueEntryId],
        update: &QueueStatusUpdate,
    ) -> Result<(), StorageError> {
        self.inner.update_queue_entries(ids, update)
    }

    fn hide_queue_entries(&self, ids: &[QueueEntryId]) -> Result<usize, StorageError> {
        self.inner.hide_queue_entries(ids)
    }
}

/// Vocabulary ids `1..=count`, words `word{id}`.
pub fn vocabulary_items(count: u64) -> Vec<VocabularyItem> {
    (1..=count)
        .map(|id| {
            let mut item = VocabularyItem::new(id, format!("word{}", id));
            item.part_of_speech = Some("noun".to_string());
            item.difficulty_score = 1.5;
            item.meaning_1 = Some(format!("meaning of {}", id));
            item
        })
        .collect()
}

/// Small batches and a short pause poll so control changes land quickly.
pub fn test_settings() -> RuntimeSettings {
    RuntimeSettings {
        batch_size: 1,
        pause_poll_interval: Duration::from_millis(50),
        default_pattern_count: 2,
        ..RuntimeSettings::default()
    }
}

pub fn client(transport: Arc<FakeTransport>) -> Arc<CompletionClient> {
    Arc::new(CompletionClient::new(
        transport,
        "You write vocabulary questions.",
        RetryPolicy::default(),
    ))
}

pub struct Harness {
    pub _dir: TempDir,
    pub store: Arc<dyn GeneratorStore>,
    pub vocabulary: Arc<JsonVocabulary>,
    pub transport: Arc<FakeTransport>,
    pub api: GeneratorApi,
}

impl Harness {
    pub fn new(vocabulary_size: u64, transport: Arc<FakeTransport>) -> Self {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn GeneratorStore> =
            Arc::new(SledGeneratorStore::open(dir.path().join("store")).unwrap());
        Self::with_store(dir, store, vocabulary_size, transport)
    }

    /// Harness whose store fails question inserts for `poisoned_word`.
    pub fn poisoned(vocabulary_size: u64, transport: Arc<FakeTransport>, poisoned_word: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let inner = SledGeneratorStore::open(dir.path().join("store")).unwrap();
        let store: Arc<dyn GeneratorStore> = Arc::new(PoisonedStore::new(inner, poisoned_word));
        Self::with_store(dir, store, vocabulary_size, transport)
    }

    /// Harness whose store fails `reset_all` and every session-less log write.
    pub fn broken_reset(vocabulary_size: u64, transport: Arc<FakeTransport>) -> Self {
        let dir = TempDir::new().unwrap();
        let inner = SledGeneratorStore::open(dir.path().join("store")).unwrap();
        let store: Arc<dyn GeneratorStore> =
            Arc::new(PoisonedStore::new(inner, "").with_broken_reset());
        Self::with_store(dir, store, vocabulary_size, transport)
    }

    fn with_store(
        dir: TempDir,
        store: Arc<dyn GeneratorStore>,
        vocabulary_size: u64,
        transport: Arc<FakeTransport>,
    ) -> Self {
        let vocabulary = Arc::new(JsonVocabulary::from_items(vocabulary_items(vocabulary_size)));
        let api = GeneratorApi::new(
            Arc::clone(&store),
            vocabulary.clone(),
            client(Arc::clone(&transport)),
            test_settings(),
            50,
        );
        Self {
            _dir: dir,
            store,
            vocabulary,
            transport,
            api,
        }
    }

    pub fn session(&self, session_id: &str) -> GenerationSession {
        self.store.fetch_session(session_id).unwrap().unwrap()
    }

    pub fn log_messages(&self, session_id: &str) -> Vec<String> {
        self.store
            .logs_for_session(session_id)
            .unwrap()
            .into_iter()
            .map(|entry| entry.message)
            .collect()
    }
}
