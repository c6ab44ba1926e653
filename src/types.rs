//! Shared identifiers and small helpers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque generation session identifier
pub type SessionId = String;

/// Vocabulary master list identifier
pub type WordId = u64;

/// Opaque regeneration queue entry identifier
pub type QueueEntryId = String;

/// Store key of one generated question row
pub type QuestionId = String;

/// Upper bound for both loop parallelism and questions per word.
pub const MAX_PARALLEL: usize = 20;
pub const MAX_PATTERN_COUNT: usize = 20;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn next_id(prefix: &str) -> String {
    let ts = now_millis();
    let pid = std::process::id();
    let seq = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{ts}-{pid}-{seq}")
}

pub fn new_session_id() -> SessionId {
    next_id("sess")
}

pub fn new_queue_entry_id() -> QueueEntryId {
    next_id("regen")
}

/// Clamp a requested loop count to `[1, MAX_PARALLEL]`.
pub fn clamp_parallel(requested: usize) -> usize {
    requested.clamp(1, MAX_PARALLEL)
}

/// Clamp a requested questions-per-word count to `[1, MAX_PATTERN_COUNT]`.
pub fn clamp_pattern_count(requested: usize) -> usize {
    requested.clamp(1, MAX_PATTERN_COUNT)
}
