//! Integration tests for the vocabulary question generator

mod completion_retry;
mod control_plane;
mod question_audit;
pub mod test_utils;
mod worker_pool;
