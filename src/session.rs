//! Session Runtime
//!
//! Executes one generation session with a resizable pool of worker loops that
//! share a FIFO queue of vocabulary items. Operators steer a running session
//! through its persisted record: `status = paused` stops loops from starting new
//! items, and `metadata.parallel` grows or shrinks the pool after each batch.

use crate::completion::{CompletionClient, ConversationContext};
use crate::config::GeneratorConfig;
use crate::error::{ApiError, StorageError};
use crate::parser::{parse_response, QuestionPayload};
use crate::store::{
    meta, record_log, GeneratedQuestionRow, GeneratorStore, LogLevel, SessionMetadata,
    SessionStatus,
};
use crate::types::{clamp_parallel, clamp_pattern_count, now_millis, SessionId};
use crate::vocabulary::VocabularyItem;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Tunables for a session runtime
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Items dequeued per loop iteration
    pub batch_size: usize,
    /// Interval between status polls while paused
    pub pause_poll_interval: Duration,
    /// Category tags offered to the model
    pub tag_pool: Vec<String>,
    /// Pattern count used when metadata does not carry one
    pub default_pattern_count: usize,
    /// Items answered under one conversation context
    pub conversation_word_limit: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            batch_size: 5,
            pause_poll_interval: Duration::from_secs(2),
            tag_pool: vec![
                "daily_life".to_string(),
                "education".to_string(),
                "action".to_string(),
            ],
            default_pattern_count: 10,
            conversation_word_limit: 10,
        }
    }
}

impl RuntimeSettings {
    pub fn from_config(config: &GeneratorConfig) -> Self {
        Self {
            batch_size: config.generation.batch_size.max(1),
            pause_poll_interval: config.generation.pause_poll_interval(),
            tag_pool: config.generation.tag_pool.clone(),
            default_pattern_count: clamp_pattern_count(config.generation.questions_per_word),
            conversation_word_limit: config.provider.effective_word_limit(),
        }
    }
}

/// Result of a finished session run
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub session_id: SessionId,
    /// Items submitted to the session
    pub submitted: usize,
    /// Items whose questions were persisted
    pub processed: u64,
    /// Persisted status when the run ended
    pub status: SessionStatus,
}

/// Why a worker loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Drained,
    ShutDown,
    Paused,
    Stopped,
}

/// What the pool does after every loop has exited with work left
enum Resumption {
    Respawn,
    Stop,
}

type LoopHandle = JoinHandle<Result<LoopExit, ApiError>>;

/// State shared by every loop of one running session
struct PoolShared {
    session_id: SessionId,
    store: Arc<dyn GeneratorStore>,
    client: Arc<CompletionClient>,
    settings: RuntimeSettings,
    pattern_count: usize,
    queue: Mutex<VecDeque<VocabularyItem>>,
    desired_parallel: Mutex<usize>,
    pending_shutdown: AtomicUsize,
    active_loops: AtomicUsize,
    next_slot: AtomicUsize,
    processed: Mutex<u64>,
    failed: AtomicBool,
    stopped: AtomicBool,
    handles: mpsc::UnboundedSender<LoopHandle>,
}

impl PoolShared {
    fn log(&self, level: LogLevel, message: &str, payload: Value) -> Result<(), StorageError> {
        record_log(
            self.store.as_ref(),
            Some(&self.session_id),
            level,
            message,
            payload,
        )
    }

    fn dequeue_batch(&self) -> Vec<VocabularyItem> {
        let mut queue = self.queue.lock();
        let take = self.settings.batch_size.min(queue.len());
        queue.drain(..take).collect()
    }

    fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Consume one pending shutdown, if any.
    fn claim_shutdown(&self) -> bool {
        self.pending_shutdown
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn should_stop(&self) -> bool {
        self.failed.load(Ordering::SeqCst) || self.stopped.load(Ordering::SeqCst)
    }

    fn current_status(&self) -> Result<Option<SessionStatus>, StorageError> {
        Ok(self
            .store
            .fetch_session(&self.session_id)?
            .map(|session| session.status))
    }

    /// Block while the session is paused. Returns `false` when the loop must stop.
    async fn wait_if_paused(&self) -> Result<bool, StorageError> {
        loop {
            if self.should_stop() {
                return Ok(false);
            }
            match self.current_status()? {
                Some(SessionStatus::Paused) => sleep(self.settings.pause_poll_interval).await,
                Some(status) if status.is_terminal() => {
                    self.stopped.store(true, Ordering::SeqCst);
                    return Ok(false);
                }
                _ => return Ok(true),
            }
        }
    }

    async fn process_item(
        &self,
        slot: usize,
        item: &VocabularyItem,
        context: &mut ConversationContext,
    ) -> Result<(), ApiError> {
        self.log(
            LogLevel::Info,
            &format!("processing {}", item.word),
            json!({ "word_id": item.id, "slot": slot }),
        )?;

        let generated = self
            .client
            .generate(item, &self.settings.tag_pool, self.pattern_count, context)
            .await
            .and_then(|raw| parse_response(&raw, self.pattern_count));

        match generated {
            Ok(questions) => {
                self.persist_questions(item, questions)?;
                self.report_progress(item)?;
            }
            Err(err) => {
                self.log(
                    LogLevel::Error,
                    &format!("error for {}", item.word),
                    json!({
                        "word_id": item.id,
                        "word": item.word,
                        "error": err.to_string(),
                        "slot": slot,
                    }),
                )?;
            }
        }
        Ok(())
    }

    fn persist_questions(
        &self,
        item: &VocabularyItem,
        questions: Vec<QuestionPayload>,
    ) -> Result<(), StorageError> {
        for (index, mut question) in questions.into_iter().enumerate() {
            let pattern_number = question.pattern_number.unwrap_or(index as u32 + 1);
            question.pattern_number = Some(pattern_number);
            let row = GeneratedQuestionRow {
                session_id: self.session_id.clone(),
                word_id: item.id,
                word: item.word.clone(),
                pattern_number,
                question,
                created_at_ms: now_millis(),
            };
            self.store.insert_question(&row)?;
        }
        Ok(())
    }

    /// Increment and write progress under one lock so the stored value only grows.
    fn report_progress(&self, item: &VocabularyItem) -> Result<(), StorageError> {
        let mut processed = self.processed.lock();
        *processed += 1;
        self.store
            .update_progress(&self.session_id, *processed, &item.word)
    }

    /// Reconcile the loop count with the persisted parallelism target.
    fn sync_parallel_limit(self: &Arc<Self>) -> Result<(), StorageError> {
        let Some(session) = self.store.fetch_session(&self.session_id)? else {
            return Ok(());
        };
        let requested = clamp_parallel(session.parallel_target());

        let to_spawn = {
            let mut desired = self.desired_parallel.lock();
            if requested == *desired {
                return Ok(());
            }
            let to_spawn = if requested > *desired {
                requested - *desired
            } else {
                let active = self.active_loops.load(Ordering::SeqCst);
                let available = active.saturating_sub(self.pending_shutdown.load(Ordering::SeqCst));
                let to_stop = available.saturating_sub(requested);
                self.pending_shutdown.fetch_add(to_stop, Ordering::SeqCst);
                0
            };
            *desired = requested;
            to_spawn
        };

        for _ in 0..to_spawn {
            spawn_loop(self);
        }
        self.log(
            LogLevel::Info,
            &format!("parallel target now {}", requested),
            json!({ "parallel": requested, "spawned": to_spawn }),
        )
    }

    /// Mark the session failed once; later failures only stop their own loop.
    fn fail(&self, err: &ApiError) {
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(store_err) = self
            .store
            .update_status(&self.session_id, SessionStatus::Failed)
        {
            error!(session_id = %self.session_id, error = %store_err, "Failed to mark session failed");
        }
        if let Err(store_err) = self.log(
            LogLevel::Error,
            &format!("session {} failed", self.session_id),
            json!({ "error": err.to_string() }),
        ) {
            error!(session_id = %self.session_id, error = %store_err, "Failed to log session failure");
        }
    }

    async fn wait_for_resume(&self) -> Result<Resumption, StorageError> {
        loop {
            if self.should_stop() {
                return Ok(Resumption::Stop);
            }
            match self.current_status()? {
                Some(SessionStatus::Paused) => sleep(self.settings.pause_poll_interval).await,
                Some(SessionStatus::Running) | Some(SessionStatus::Pending) => {
                    return Ok(Resumption::Respawn)
                }
                Some(_) | None => return Ok(Resumption::Stop),
            }
        }
    }
}

fn spawn_loop(shared: &Arc<PoolShared>) {
    let slot = shared.next_slot.fetch_add(1, Ordering::SeqCst);
    shared.active_loops.fetch_add(1, Ordering::SeqCst);
    let handle = tokio::spawn(loop_task(Arc::clone(shared), slot));
    if shared.handles.send(handle).is_err() {
        warn!(session_id = %shared.session_id, slot, "Worker registry closed; loop runs untracked");
    }
}

async fn loop_task(shared: Arc<PoolShared>, slot: usize) -> Result<LoopExit, ApiError> {
    debug!(session_id = %shared.session_id, slot, "Worker loop started");
    let result = run_loop(&shared, slot).await;
    shared.active_loops.fetch_sub(1, Ordering::SeqCst);
    match &result {
        Ok(exit) => debug!(session_id = %shared.session_id, slot, ?exit, "Worker loop exited"),
        Err(err) => {
            error!(session_id = %shared.session_id, slot, error = %err, "Worker loop failed");
            shared.fail(err);
        }
    }
    result
}

async fn run_loop(shared: &Arc<PoolShared>, slot: usize) -> Result<LoopExit, ApiError> {
    let mut context = ConversationContext::new(
        shared.session_id.clone(),
        slot,
        shared.settings.conversation_word_limit,
    );

    loop {
        if shared.should_stop() {
            return Ok(LoopExit::Stopped);
        }
        if shared.claim_shutdown() {
            return Ok(LoopExit::ShutDown);
        }
        let batch = shared.dequeue_batch();
        if batch.is_empty() {
            return Ok(LoopExit::Drained);
        }

        for item in &batch {
            if !shared.wait_if_paused().await? {
                return Ok(LoopExit::Stopped);
            }
            shared.process_item(slot, item, &mut context).await?;
        }

        if shared.current_status()? == Some(SessionStatus::Paused) {
            return Ok(LoopExit::Paused);
        }
        shared.sync_parallel_limit()?;
    }
}

/// One generation session over an explicit list of items.
pub struct SessionRuntime {
    items: Vec<VocabularyItem>,
    metadata: SessionMetadata,
    pattern_count: usize,
    parallel: Mutex<usize>,
    store: Arc<dyn GeneratorStore>,
    client: Arc<CompletionClient>,
    settings: RuntimeSettings,
    session_id: Mutex<Option<SessionId>>,
    started: AtomicBool,
}

impl SessionRuntime {
    /// Build a runtime. `metadata.pattern_count` is clamped to `[1, 20]`; when
    /// absent the settings default applies.
    pub fn new(
        items: Vec<VocabularyItem>,
        metadata: SessionMetadata,
        store: Arc<dyn GeneratorStore>,
        client: Arc<CompletionClient>,
        settings: RuntimeSettings,
    ) -> Self {
        let pattern_count = metadata
            .get(meta::PATTERN_COUNT)
            .and_then(Value::as_f64)
            .filter(|n| n.is_finite() && *n >= 1.0)
            .map(|n| clamp_pattern_count(n.floor() as usize))
            .unwrap_or_else(|| clamp_pattern_count(settings.default_pattern_count));
        Self {
            items,
            metadata,
            pattern_count,
            parallel: Mutex::new(1),
            store,
            client,
            settings,
            session_id: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn pattern_count(&self) -> usize {
        self.pattern_count
    }

    pub fn parallel_limit(&self) -> usize {
        *self.parallel.lock()
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Session id, once `start` has created the record.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id.lock().clone()
    }

    /// Set the loop count, clamped to `[1, 20]`. Once running, the value is
    /// written to the session record and applied after the next batch.
    pub fn set_parallel_limit(&self, limit: usize) -> Result<usize, ApiError> {
        let normalized = clamp_parallel(limit);
        *self.parallel.lock() = normalized;
        if let Some(session_id) = self.session_id() {
            self.store.update_parallel(&session_id, normalized)?;
        }
        Ok(normalized)
    }

    /// Run the session until the queue drains, a loop fails or an operator
    /// ends it.
    pub async fn start(&self) -> Result<SessionOutcome, ApiError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ApiError::AlreadyStarted(
                self.session_id().unwrap_or_default(),
            ));
        }

        let parallel = self.parallel_limit();
        let mut metadata = self.metadata.clone();
        metadata.insert(meta::PARALLEL.to_string(), Value::from(parallel as u64));
        metadata.insert(
            meta::PATTERN_COUNT.to_string(),
            Value::from(self.pattern_count as u64),
        );

        let session = self.store.create_session(parallel, metadata)?;
        *self.session_id.lock() = Some(session.id.clone());
        record_log(
            self.store.as_ref(),
            Some(&session.id),
            LogLevel::Info,
            &format!("session {} started", session.id),
            json!({ "parallel_limit": parallel, "items": self.items.len() }),
        )?;
        self.store
            .update_status(&session.id, SessionStatus::Running)?;

        let (handles_tx, mut handles_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PoolShared {
            session_id: session.id.clone(),
            store: Arc::clone(&self.store),
            client: Arc::clone(&self.client),
            settings: self.settings.clone(),
            pattern_count: self.pattern_count,
            queue: Mutex::new(self.items.iter().cloned().collect()),
            desired_parallel: Mutex::new(parallel),
            pending_shutdown: AtomicUsize::new(0),
            active_loops: AtomicUsize::new(0),
            next_slot: AtomicUsize::new(1),
            processed: Mutex::new(0),
            failed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            handles: handles_tx,
        });

        info!(session_id = %session.id, parallel, items = self.items.len(), pattern_count = self.pattern_count, "Session started");
        for _ in 0..parallel {
            spawn_loop(&shared);
        }

        let mut first_error: Option<ApiError> = None;
        loop {
            join_all_loops(&shared, &mut handles_rx, &mut first_error).await;

            if shared.failed.load(Ordering::SeqCst) || shared.queue_len() == 0 {
                break;
            }
            // Every loop wound down with items left: a pause or an external stop.
            match shared.wait_for_resume().await {
                Ok(Resumption::Respawn) => {
                    let target = match shared.store.fetch_session(&shared.session_id) {
                        Ok(Some(record)) => clamp_parallel(record.parallel_target()),
                        Ok(None) => *shared.desired_parallel.lock(),
                        Err(err) => {
                            let err = ApiError::from(err);
                            shared.fail(&err);
                            first_error.get_or_insert(err);
                            break;
                        }
                    };
                    *shared.desired_parallel.lock() = target;
                    shared.pending_shutdown.store(0, Ordering::SeqCst);
                    info!(session_id = %shared.session_id, parallel = target, remaining = shared.queue_len(), "Session resumed; respawning worker loops");
                    for _ in 0..target {
                        spawn_loop(&shared);
                    }
                }
                Ok(Resumption::Stop) => {
                    shared.stopped.store(true, Ordering::SeqCst);
                    break;
                }
                Err(err) => {
                    let err = ApiError::from(err);
                    shared.fail(&err);
                    first_error.get_or_insert(err);
                    break;
                }
            }
        }

        if shared.failed.load(Ordering::SeqCst) {
            return Err(first_error.unwrap_or_else(|| {
                ApiError::WorkerPanicked(format!("session {} failed", shared.session_id))
            }));
        }

        let processed = *shared.processed.lock();
        let status = if shared.stopped.load(Ordering::SeqCst) {
            let status = shared
                .current_status()?
                .unwrap_or(SessionStatus::Failed);
            warn!(session_id = %shared.session_id, %status, remaining = shared.queue_len(), "Session ended externally");
            status
        } else {
            self.store
                .update_status(&shared.session_id, SessionStatus::Completed)?;
            shared.log(
                LogLevel::Info,
                &format!("session {} completed", shared.session_id),
                json!({ "processed": processed }),
            )?;
            SessionStatus::Completed
        };

        Ok(SessionOutcome {
            session_id: shared.session_id.clone(),
            submitted: self.items.len(),
            processed,
            status,
        })
    }
}

/// Await every registered loop, including loops spawned while waiting.
async fn join_all_loops(
    shared: &Arc<PoolShared>,
    handles_rx: &mut mpsc::UnboundedReceiver<LoopHandle>,
    first_error: &mut Option<ApiError>,
) {
    let mut running = FuturesUnordered::new();
    loop {
        while let Ok(handle) = handles_rx.try_recv() {
            running.push(handle);
        }
        let Some(joined) = running.next().await else {
            break;
        };
        match joined {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                first_error.get_or_insert(err);
            }
            Err(join_err) => {
                let err = ApiError::WorkerPanicked(join_err.to_string());
                shared.fail(&err);
                first_error.get_or_insert(err);
            }
        }
    }
}
