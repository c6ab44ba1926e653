//! Integration tests for the session runtime's worker pool

use crate::integration::test_utils::{FakeTransport, Harness, Reply};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use vocabgen::controller::GenerationRequest;
use vocabgen::error::ApiError;
use vocabgen::session::SessionRuntime;
use vocabgen::store::{SessionMetadata, SessionStatus};

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

async fn wait_for_session(runtime: &SessionRuntime) -> String {
    loop {
        if let Some(id) = runtime.session_id() {
            return id;
        }
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn raising_parallelism_spawns_loops_after_the_current_batch() {
    let transport = FakeTransport::with_delay(Duration::from_millis(100));
    let h = Harness::new(20, transport.clone());
    let (_plan, runtime) = h.api.prepare_generation(&request(20, 1)).unwrap();
    let runtime = Arc::new(runtime);

    let started = Instant::now();
    let task = tokio::spawn({
        let runtime = Arc::clone(&runtime);
        async move { runtime.start().await }
    });
    let session_id = wait_for_session(&runtime).await;
    assert_eq!(runtime.set_parallel_limit(4).unwrap(), 4);

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.processed, 20);
    assert_eq!(transport.max_in_flight(), 4);
    // One item alone, then 19 items over four loops.
    assert!(started.elapsed() <= Duration::from_millis(700));

    let session = h.session(&session_id);
    assert_eq!(session.parallel_target(), 4);
    assert_eq!(session.progress, 20);
    assert!(h
        .log_messages(&session_id)
        .contains(&"parallel target now 4".to_string()));
}

#[tokio::test(start_paused = true)]
async fn lowering_parallelism_retires_surplus_loops() {
    let transport = FakeTransport::with_delay(Duration::from_millis(100));
    let h = Harness::new(20, transport.clone());
    let (_plan, runtime) = h.api.prepare_generation(&request(20, 4)).unwrap();
    let runtime = Arc::new(runtime);

    let started = Instant::now();
    let task = tokio::spawn({
        let runtime = Arc::clone(&runtime);
        async move { runtime.start().await }
    });
    let session_id = wait_for_session(&runtime).await;
    h.api.set_session_parallel(&session_id, 1).unwrap();

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.processed, 20);
    assert_eq!(transport.max_in_flight(), 4);
    assert_eq!(h.store.questions_for_session(&session_id).unwrap().len(), 40);

    // First round at four loops, then the surplus three retire after their batch.
    let starts = transport.call_starts();
    assert_eq!(starts.len(), 20);
    let item = Duration::from_millis(100);
    assert!(starts[..4].iter().all(|t| *t - started < item));

    // The remaining sixteen items run back to back on exactly one loop: never
    // overlapping, never idle.
    let first_single = starts[4] - started;
    assert!(first_single >= item && first_single < item + Duration::from_millis(10));
    for pair in starts[4..].windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= item && gap < item + Duration::from_millis(10),
            "gap {gap:?}"
        );
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1700), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1800), "elapsed {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn paused_session_starts_no_new_items_until_resumed() {
    let transport = FakeTransport::with_delay(Duration::from_millis(100));
    let h = Harness::new(10, transport.clone());
    let (_plan, runtime) = h.api.prepare_generation(&request(10, 2)).unwrap();
    let runtime = Arc::new(runtime);

    let task = tokio::spawn({
        let runtime = Arc::clone(&runtime);
        async move { runtime.start().await }
    });
    let session_id = wait_for_session(&runtime).await;
    h.api.pause_session(&session_id).unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    let calls_at_pause = transport.calls().len();
    assert!(calls_at_pause <= 2);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(transport.calls().len(), calls_at_pause);
    let paused = h.session(&session_id);
    assert_eq!(paused.status, SessionStatus::Paused);
    assert_eq!(paused.progress as usize, calls_at_pause);
    assert_eq!(
        h.store.questions_for_session(&session_id).unwrap().len(),
        calls_at_pause * 2
    );

    let report = h.api.resume_session(&session_id, None).await.unwrap();
    assert!(report.resumed);
    assert!(!report.new_session_started);

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.processed, 10);
    assert_eq!(transport.calls().len(), 10);
    assert_eq!(h.session(&session_id).progress, 10);
}

#[tokio::test(start_paused = true)]
async fn external_terminal_status_ends_the_run_without_override() {
    let transport = FakeTransport::with_delay(Duration::from_millis(100));
    let h = Harness::new(10, transport.clone());
    let (_plan, runtime) = h.api.prepare_generation(&request(10, 1)).unwrap();
    let runtime = Arc::new(runtime);

    let task = tokio::spawn({
        let runtime = Arc::clone(&runtime);
        async move { runtime.start().await }
    });
    let session_id = wait_for_session(&runtime).await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    h.store
        .update_status(&session_id, SessionStatus::Failed)
        .unwrap();

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome.status, SessionStatus::Failed);
    assert_eq!(outcome.processed, 3);
    assert_eq!(transport.calls().len(), 3);
    assert_eq!(h.session(&session_id).status, SessionStatus::Failed);
}

#[tokio::test]
async fn persistence_failure_fails_the_whole_session() {
    let transport = FakeTransport::new();
    let h = Harness::poisoned(6, transport, "word3");

    let err = h.api.start_generation(request(6, 2)).await.unwrap_err();
    assert!(matches!(err, ApiError::StorageError(_)), "got {err:?}");

    let session = h.store.fetch_latest_session().unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert!(session.finished_at_ms.is_some());
    let failed_line = format!("session {} failed", session.id);
    assert!(h.log_messages(&session.id).contains(&failed_line));
}

#[tokio::test]
async fn unparseable_reply_skips_only_that_word() {
    let transport = FakeTransport::new();
    transport.script("word2", vec![Reply::Prose]);
    let h = Harness::new(4, transport.clone());

    let result = h.api.start_generation(request(4, 2)).await.unwrap();
    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(result.processed, 4);

    let session = h.session(&result.session_id);
    assert_eq!(session.progress, 3);
    let rows = h.store.questions_for_session(&result.session_id).unwrap();
    assert_eq!(rows.len(), 6);
    assert!(rows.iter().all(|row| row.word_id != 2));
    assert!(h.store.questions_for_word(2).unwrap().is_empty());
    // Prose is terminal: no retries.
    assert_eq!(
        transport.calls().iter().filter(|w| *w == "word2").count(),
        1
    );
}
