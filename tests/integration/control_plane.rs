//! Integration tests for operator controls: pause, resume, parallelism, status, reset

use crate::integration::test_utils::{question_array, FakeTransport, Harness, Reply};
use serde_json::json;
use vocabgen::control::StatusReport;
use vocabgen::controller::GenerationRequest;
use vocabgen::error::ApiError;
use vocabgen::parser::parse_response;
use vocabgen::regeneration::RegenerationRequest;
use vocabgen::store::{GeneratedQuestionRow, LogLevel, SessionMetadata, SessionStatus};

fn metadata(value: serde_json::Value) -> SessionMetadata {
    value.as_object().cloned().unwrap()
}

fn request(limit: usize, parallel: usize) -> GenerationRequest {
    GenerationRequest {
        parallel,
        start_word_id: 1,
        limit,
        pattern_count: Some(2),
        resume_existing: false,
        metadata: SessionMetadata::new(),
    }
}

#[test]
fn parallel_updates_are_clamped_and_logged() {
    let h = Harness::new(5, FakeTransport::new());
    let session = h.store.create_session(2, SessionMetadata::new()).unwrap();

    assert_eq!(h.api.set_session_parallel(&session.id, 0).unwrap(), 1);
    assert_eq!(h.session(&session.id).parallel_target(), 1);
    assert_eq!(h.api.set_session_parallel(&session.id, 64).unwrap(), 20);

    let stored = h.session(&session.id);
    assert_eq!(stored.parallel_target(), 20);
    assert_eq!(stored.parallel_slot, Some(20));
    assert!(h
        .log_messages(&session.id)
        .contains(&"parallel updated to 20".to_string()));

    let err = h.api.set_session_parallel("sess-missing", 3).unwrap_err();
    assert!(matches!(err, ApiError::SessionNotFound(_)));
}

#[tokio::test]
async fn resume_flips_paused_and_ignores_running() {
    let h = Harness::new(5, FakeTransport::new());
    let session = h.store.create_session(1, SessionMetadata::new()).unwrap();
    h.store
        .update_status(&session.id, SessionStatus::Running)
        .unwrap();

    let report = h.api.resume_session(&session.id, None).await.unwrap();
    assert!(!report.resumed);
    assert_eq!(report.message.as_deref(), Some("session already running"));

    h.api.pause_session(&session.id).unwrap();
    assert_eq!(h.session(&session.id).status, SessionStatus::Paused);

    let report = h.api.resume_session(&session.id, None).await.unwrap();
    assert!(report.resumed);
    assert!(!report.new_session_started);
    assert_eq!(h.session(&session.id).status, SessionStatus::Running);

    let messages = h.log_messages(&session.id);
    assert!(messages.contains(&"session paused by operator".to_string()));
    assert!(messages.contains(&"session resumed by operator".to_string()));
}

#[tokio::test]
async fn resume_restarts_an_interrupted_session_over_the_remaining_words() {
    let transport = FakeTransport::new();
    let h = Harness::new(10, transport.clone());
    let old = h
        .store
        .create_session(
            3,
            metadata(json!({ "start_word_id": 1, "limit": 6, "pattern_count": 2, "parallel": 3 })),
        )
        .unwrap();
    h.store.update_progress(&old.id, 2, "word2").unwrap();

    let report = h.api.resume_session(&old.id, Some(2)).await.unwrap();
    assert!(report.resumed);
    assert!(report.new_session_started);
    assert_eq!(report.previous_session_id.as_deref(), Some(old.id.as_str()));
    assert_eq!(report.processed, 4);

    let previous = h.session(&old.id);
    assert_eq!(previous.status, SessionStatus::Failed);
    assert!(h
        .log_messages(&old.id)
        .contains(&"session interrupted; resuming".to_string()));

    let new_id = report.session_id.unwrap();
    let restarted = h.session(&new_id);
    assert_eq!(restarted.status, SessionStatus::Completed);
    assert_eq!(restarted.start_word_id(), Some(3));
    assert_eq!(restarted.limit(), Some(4));
    assert_eq!(restarted.parallel_target(), 2);
    assert_eq!(
        restarted.meta_str("resumed_from_session_id"),
        Some(old.id.as_str())
    );

    let mut called = transport.calls();
    called.sort();
    assert_eq!(called, vec!["word3", "word4", "word5", "word6"]);
}

#[tokio::test]
async fn resume_reports_when_nothing_remains() {
    let h = Harness::new(10, FakeTransport::new());
    let done = h
        .store
        .create_session(1, metadata(json!({ "start_word_id": 1, "limit": 3 })))
        .unwrap();
    h.store.update_progress(&done.id, 3, "word3").unwrap();
    h.store
        .update_status(&done.id, SessionStatus::Failed)
        .unwrap();

    let report = h.api.resume_session(&done.id, None).await.unwrap();
    assert!(!report.resumed);
    assert!(report.session_id.is_none());
    assert_eq!(
        report.message.as_deref(),
        Some("all words already processed")
    );

    let err = h.api.resume_session("sess-unknown", None).await.unwrap_err();
    assert!(matches!(err, ApiError::SessionNotFound(_)));
}

#[tokio::test]
async fn status_summarizes_the_latest_session() {
    let transport = FakeTransport::new();
    transport.script("word2", vec![Reply::Prose]);
    let h = Harness::new(10, transport);

    assert_eq!(h.api.session_status().unwrap(), StatusReport::Idle);

    let result = h.api.start_generation(request(3, 1)).await.unwrap();
    let StatusReport::Session(summary) = h.api.session_status().unwrap() else {
        panic!("expected a session summary");
    };
    assert_eq!(summary.session_id, result.session_id);
    assert_eq!(summary.status, SessionStatus::Completed);
    assert_eq!(summary.progress, 2);
    assert_eq!(summary.total_words, Some(3));
    assert_eq!(summary.failures, 1);
    assert_eq!(summary.note, "word3");
    assert_eq!(summary.start_word_id, Some(1));
    assert_eq!(summary.parallel, Some(1));
    assert_eq!(summary.pattern_count, Some(2));

    let session = h.session(&result.session_id);
    assert_eq!(Some(summary.updated_at_ms), session.finished_at_ms);
}

#[test]
fn status_note_has_a_placeholder_before_any_word() {
    let h = Harness::new(3, FakeTransport::new());
    h.store.create_session(1, SessionMetadata::new()).unwrap();
    let StatusReport::Session(summary) = h.api.session_status().unwrap() else {
        panic!("expected a session summary");
    };
    assert_eq!(summary.note, "No word processed yet");
    assert_eq!(summary.failures, 0);
}

#[test]
fn failure_count_ignores_words_that_later_got_questions() {
    let h = Harness::new(10, FakeTransport::new());
    let session = h.store.create_session(1, SessionMetadata::new()).unwrap();
    for word_id in [7u64, 8, 8] {
        h.store
            .log(
                Some(&session.id),
                LogLevel::Error,
                "error",
                json!({ "word_id": word_id }),
            )
            .unwrap();
    }
    h.store
        .log(Some(&session.id), LogLevel::Warn, "retry", json!({ "word_id": 9 }))
        .unwrap();
    assert_eq!(h.api.failure_count(&session.id).unwrap(), 2);

    let question = parse_response(&question_array("word7", 1), 1)
        .unwrap()
        .remove(0);
    h.store
        .insert_question(&GeneratedQuestionRow {
            session_id: session.id.clone(),
            word_id: 7,
            word: "word7".to_string(),
            pattern_number: 1,
            question,
            created_at_ms: 1,
        })
        .unwrap();
    assert_eq!(h.api.failure_count(&session.id).unwrap(), 1);
}

#[tokio::test]
async fn reset_clears_generated_data_and_keeps_the_queue() {
    let h = Harness::new(5, FakeTransport::new());
    let result = h.api.start_generation(request(2, 1)).await.unwrap();
    h.api
        .add_to_regeneration_queue(&[RegenerationRequest {
            word_id: 1,
            word: None,
            reason: None,
        }])
        .unwrap();

    let summary = h.api.reset_generator_data(Some("new prompt")).unwrap();
    assert_eq!(summary.questions_deleted, 4);
    assert_eq!(summary.sessions_deleted, 1);
    assert!(summary.logs_deleted > 0);

    assert_eq!(h.api.session_status().unwrap(), StatusReport::Idle);
    assert!(h.store.fetch_session(&result.session_id).unwrap().is_none());
    assert!(h.store.questions_for_word(1).unwrap().is_empty());
    assert_eq!(h.api.list_regeneration_queue(None).unwrap().len(), 1);
}

#[test]
fn failed_reset_reports_the_reset_error_even_when_logging_fails() {
    let h = Harness::broken_reset(3, FakeTransport::new());
    let session = h.store.create_session(1, SessionMetadata::new()).unwrap();

    let err = h.api.reset_generator_data(Some("prompt change")).unwrap_err();
    match err {
        ApiError::StorageError(inner) => assert!(inner.to_string().contains("reset interrupted")),
        other => panic!("expected the reset error, got {other:?}"),
    }
    assert!(h.store.fetch_session(&session.id).unwrap().is_some());
}
