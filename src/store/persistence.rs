//! Sled-backed generator store.
//!
//! One tree per table, JSON values. Session and queue read-modify-write
//! sequences run under a single writer lock so concurrent worker loops and
//! operators never drop each other's fields.

use std::collections::HashSet;
use std::io;
use std::path::Path;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sled::{Db, Tree};

use crate::error::StorageError;
use crate::store::{
    meta, GenerationSession, GeneratedQuestionRow, GeneratorStore, LogLevel, NewQueueEntry,
    QueueStatus, QueueStatusUpdate, RegenerationQueueEntry, ResetSummary, SessionLogEntry,
    SessionMetadata, SessionStatus, StoredQuestion,
};
use crate::types::{
    new_queue_entry_id, new_session_id, now_millis, QuestionId, QueueEntryId, WordId,
};

const TREE_SESSIONS: &str = "generator_sessions";
const TREE_LOGS: &str = "generation_logs";
const TREE_QUESTIONS: &str = "generated_questions";
const TREE_QUEUE: &str = "regeneration_queue";
const KEY_PAD: usize = 20;
const GLOBAL_LOG_PREFIX: &str = "_global";

/// Sled implementation of [`GeneratorStore`]
pub struct SledGeneratorStore {
    db: Db,
    sessions: Tree,
    logs: Tree,
    questions: Tree,
    queue: Tree,
    write_lock: Mutex<()>,
}

impl SledGeneratorStore {
    /// Open (or create) a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path.as_ref()).map_err(|e| {
            StorageError::IoError(io::Error::new(
                io::ErrorKind::Other,
                format!("Failed to open sled database: {}", e),
            ))
        })?;
        Self::new(db)
    }

    pub fn new(db: Db) -> Result<Self, StorageError> {
        let sessions = db.open_tree(TREE_SESSIONS).map_err(to_storage_io)?;
        let logs = db.open_tree(TREE_LOGS).map_err(to_storage_io)?;
        let questions = db.open_tree(TREE_QUESTIONS).map_err(to_storage_io)?;
        let queue = db.open_tree(TREE_QUEUE).map_err(to_storage_io)?;
        Ok(Self {
            db,
            sessions,
            logs,
            questions,
            queue,
            write_lock: Mutex::new(()),
        })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(to_storage_io)?;
        Ok(())
    }

    fn next_seq(&self) -> Result<u64, StorageError> {
        self.db.generate_id().map_err(to_storage_io)
    }

    fn put_session(&self, session: &GenerationSession) -> Result<(), StorageError> {
        put_json(&self.sessions, session.id.as_bytes(), session)
    }

    /// Read-modify-write one session under the writer lock.
    fn modify_session<F>(&self, session_id: &str, apply: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut GenerationSession),
    {
        let _guard = self.write_lock.lock();
        let mut session: GenerationSession = get_json(&self.sessions, session_id.as_bytes())?
            .ok_or_else(|| StorageError::SessionNotFound(session_id.to_string()))?;
        apply(&mut session);
        session.updated_at_ms = now_millis();
        self.put_session(&session)
    }

    fn all_queue_entries(&self) -> Result<Vec<RegenerationQueueEntry>, StorageError> {
        scan_json(&self.queue, b"")
    }
}

impl GeneratorStore for SledGeneratorStore {
    fn create_session(
        &self,
        parallel: usize,
        metadata: SessionMetadata,
    ) -> Result<GenerationSession, StorageError> {
        let now = now_millis();
        let session = GenerationSession {
            id: new_session_id(),
            status: SessionStatus::Pending,
            parallel,
            parallel_slot: None,
            current_word: None,
            progress: 0,
            metadata,
            created_at_ms: now,
            updated_at_ms: now,
            finished_at_ms: None,
            created_seq: self.next_seq()?,
        };
        let _guard = self.write_lock.lock();
        self.put_session(&session)?;
        Ok(session)
    }

    fn update_status(&self, session_id: &str, status: SessionStatus) -> Result<(), StorageError> {
        self.modify_session(session_id, |session| {
            session.status = status;
            session.finished_at_ms = status.is_terminal().then(now_millis);
        })
    }

    fn update_progress(
        &self,
        session_id: &str,
        progress: u64,
        current_word: &str,
    ) -> Result<(), StorageError> {
        self.modify_session(session_id, |session| {
            session.progress = session.progress.max(progress);
            session.current_word = Some(current_word.to_string());
        })
    }

    fn update_parallel(&self, session_id: &str, parallel: usize) -> Result<(), StorageError> {
        self.modify_session(session_id, |session| {
            session
                .metadata
                .insert(meta::PARALLEL.to_string(), Value::from(parallel as u64));
            session.parallel_slot = Some(parallel);
        })
    }

    fn fetch_session(&self, session_id: &str) -> Result<Option<GenerationSession>, StorageError> {
        get_json(&self.sessions, session_id.as_bytes())
    }

    fn fetch_latest_session(&self) -> Result<Option<GenerationSession>, StorageError> {
        let sessions: Vec<GenerationSession> = scan_json(&self.sessions, b"")?;
        Ok(sessions
            .into_iter()
            .max_by_key(|s| (s.created_at_ms, s.created_seq)))
    }

    fn insert_question(&self, row: &GeneratedQuestionRow) -> Result<(), StorageError> {
        let key = format!("{:0pad$}:{:0pad$}", row.word_id, self.next_seq()?, pad = KEY_PAD);
        put_json(&self.questions, key.as_bytes(), row)
    }

    fn questions_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<GeneratedQuestionRow>, StorageError> {
        let rows: Vec<GeneratedQuestionRow> = scan_json(&self.questions, b"")?;
        Ok(rows
            .into_iter()
            .filter(|row| row.session_id == session_id)
            .collect())
    }

    fn questions_for_word(
        &self,
        word_id: WordId,
    ) -> Result<Vec<GeneratedQuestionRow>, StorageError> {
        scan_json(&self.questions, word_prefix(word_id).as_bytes())
    }

    fn delete_questions_for_words(&self, word_ids: &[WordId]) -> Result<usize, StorageError> {
        let mut removed = 0usize;
        for word_id in word_ids {
            let prefix = word_prefix(*word_id);
            let keys = collect_keys(&self.questions, prefix.as_bytes())?;
            for key in keys {
                self.questions.remove(key).map_err(to_storage_io)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn all_questions(&self) -> Result<Vec<StoredQuestion>, StorageError> {
        let mut out = Vec::new();
        for result in self.questions.iter() {
            let (key, value) = result.map_err(to_storage_io)?;
            out.push(StoredQuestion {
                id: String::from_utf8_lossy(&key).into_owned(),
                row: serde_json::from_slice(&value).map_err(to_storage_data)?,
            });
        }
        Ok(out)
    }

    fn questions_by_ids(&self, ids: &[QuestionId]) -> Result<Vec<StoredQuestion>, StorageError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = get_json(&self.questions, id.as_bytes())? {
                out.push(StoredQuestion {
                    id: id.clone(),
                    row,
                });
            }
        }
        Ok(out)
    }

    fn update_question(
        &self,
        id: &str,
        row: &GeneratedQuestionRow,
    ) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock();
        if !self.questions.contains_key(id).map_err(to_storage_io)? {
            return Ok(false);
        }
        put_json(&self.questions, id.as_bytes(), row)?;
        Ok(true)
    }

    fn log(
        &self,
        session_id: Option<&str>,
        level: LogLevel,
        message: &str,
        payload: Value,
    ) -> Result<(), StorageError> {
        let seq = self.next_seq()?;
        let entry = SessionLogEntry {
            seq,
            session_id: session_id.map(str::to_string),
            level,
            message: message.to_string(),
            payload,
            created_at_ms: now_millis(),
        };
        let key = format!(
            "{}:{:0pad$}",
            session_id.unwrap_or(GLOBAL_LOG_PREFIX),
            seq,
            pad = KEY_PAD
        );
        put_json(&self.logs, key.as_bytes(), &entry)
    }

    fn logs_for_session(&self, session_id: &str) -> Result<Vec<SessionLogEntry>, StorageError> {
        let prefix = format!("{session_id}:");
        let mut entries: Vec<SessionLogEntry> = scan_json(&self.logs, prefix.as_bytes())?;
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    fn reset_all(&self) -> Result<ResetSummary, StorageError> {
        let _guard = self.write_lock.lock();
        let summary = ResetSummary {
            questions_deleted: self.questions.len(),
            logs_deleted: self.logs.len(),
            sessions_deleted: self.sessions.len(),
        };
        self.questions.clear().map_err(to_storage_io)?;
        self.logs.clear().map_err(to_storage_io)?;
        self.sessions.clear().map_err(to_storage_io)?;
        Ok(summary)
    }

    fn insert_queue_entries(
        &self,
        entries: &[NewQueueEntry],
    ) -> Result<Vec<RegenerationQueueEntry>, StorageError> {
        let _guard = self.write_lock.lock();
        let mut in_flight: HashSet<WordId> = self
            .all_queue_entries()?
            .into_iter()
            .filter(|entry| entry.status.is_in_flight())
            .map(|entry| entry.word_id)
            .collect();

        let mut inserted = Vec::new();
        for new_entry in entries {
            if !in_flight.insert(new_entry.word_id) {
                continue;
            }
            let now = now_millis();
            let entry = RegenerationQueueEntry {
                id: new_queue_entry_id(),
                word_id: new_entry.word_id,
                word: new_entry.word.clone(),
                reason: new_entry.reason.clone(),
                status: QueueStatus::Pending,
                session_id: None,
                last_error: None,
                hidden: false,
                created_at_ms: now,
                updated_at_ms: now,
                created_seq: self.next_seq()?,
            };
            put_json(&self.queue, entry.id.as_bytes(), &entry)?;
            inserted.push(entry);
        }
        Ok(inserted)
    }

    fn fetch_queue_entries(
        &self,
        statuses: &[QueueStatus],
        limit: usize,
    ) -> Result<Vec<RegenerationQueueEntry>, StorageError> {
        let mut entries: Vec<RegenerationQueueEntry> = self
            .all_queue_entries()?
            .into_iter()
            .filter(|entry| !entry.hidden && statuses.contains(&entry.status))
            .collect();
        entries.sort_by_key(|e| (e.created_at_ms, e.created_seq));
        entries.truncate(limit);
        Ok(entries)
    }

    fn update_queue_entries(
        &self,
        ids: &[QueueEntryId],
        update: &QueueStatusUpdate,
    ) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock();
        for id in ids {
            let mut entry: RegenerationQueueEntry = get_json(&self.queue, id.as_bytes())?
                .ok_or_else(|| StorageError::QueueEntryNotFound(id.clone()))?;
            entry.status = update.status;
            if update.session_id.is_some() {
                entry.session_id = update.session_id.clone();
            }
            entry.last_error = update.last_error.clone();
            entry.updated_at_ms = now_millis();
            put_json(&self.queue, id.as_bytes(), &entry)?;
        }
        Ok(())
    }

    fn hide_queue_entries(&self, ids: &[QueueEntryId]) -> Result<usize, StorageError> {
        let _guard = self.write_lock.lock();
        let mut hidden = 0usize;
        for id in ids {
            let Some(mut entry) = get_json::<RegenerationQueueEntry>(&self.queue, id.as_bytes())?
            else {
                continue;
            };
            entry.hidden = true;
            entry.updated_at_ms = now_millis();
            put_json(&self.queue, id.as_bytes(), &entry)?;
            hidden += 1;
        }
        Ok(hidden)
    }
}

fn word_prefix(word_id: WordId) -> String {
    format!("{:0pad$}:", word_id, pad = KEY_PAD)
}

fn put_json<T: Serialize>(tree: &Tree, key: &[u8], value: &T) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(value).map_err(to_storage_data)?;
    tree.insert(key, bytes).map_err(to_storage_io)?;
    Ok(())
}

fn get_json<T: DeserializeOwned>(tree: &Tree, key: &[u8]) -> Result<Option<T>, StorageError> {
    let Some(raw) = tree.get(key).map_err(to_storage_io)? else {
        return Ok(None);
    };
    let parsed = serde_json::from_slice(&raw).map_err(to_storage_data)?;
    Ok(Some(parsed))
}

fn scan_json<T: DeserializeOwned>(tree: &Tree, prefix: &[u8]) -> Result<Vec<T>, StorageError> {
    let mut out = Vec::new();
    for result in tree.scan_prefix(prefix) {
        let (_, value) = result.map_err(to_storage_io)?;
        out.push(serde_json::from_slice(&value).map_err(to_storage_data)?);
    }
    Ok(out)
}

fn collect_keys(tree: &Tree, prefix: &[u8]) -> Result<Vec<sled::IVec>, StorageError> {
    let mut keys = Vec::new();
    for result in tree.scan_prefix(prefix) {
        let (key, _) = result.map_err(to_storage_io)?;
        keys.push(key);
    }
    Ok(keys)
}

fn to_storage_io(err: sled::Error) -> StorageError {
    StorageError::IoError(io::Error::new(io::ErrorKind::Other, err.to_string()))
}

fn to_storage_data(err: serde_json::Error) -> StorageError {
    StorageError::DataError(err.to_string())
}
