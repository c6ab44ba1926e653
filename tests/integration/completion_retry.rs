//! Integration tests for completion retries as seen through a generation run

use crate::integration::test_utils::{test_settings, vocabulary_items, FakeTransport, Harness, Reply};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;
use vocabgen::api::GeneratorApi;
use vocabgen::completion::{CompletionClient, RetryPolicy};
use vocabgen::control::StatusReport;
use vocabgen::controller::GenerationRequest;
use vocabgen::provider::OpenAIClient;
use vocabgen::store::{GeneratorStore, LogLevel, SessionMetadata, SessionStatus, SledGeneratorStore};
use vocabgen::vocabulary::JsonVocabulary;

fn single_word() -> GenerationRequest {
    GenerationRequest {
        parallel: 1,
        start_word_id: 1,
        limit: 1,
        pattern_count: Some(2),
        resume_existing: false,
        metadata: SessionMetadata::new(),
    }
}

#[tokio::test(start_paused = true)]
async fn throttled_replies_wait_for_the_server_hint_then_the_default() {
    let transport = FakeTransport::new();
    transport.script(
        "word1",
        vec![
            Reply::Status(
                429,
                r#"{"error":{"details":[{"@type":"RetryInfo","retryDelay":"1.5s"}]}}"#.to_string(),
            ),
            Reply::Status(503, "overloaded".to_string()),
            Reply::Questions,
        ],
    );
    let h = Harness::new(3, transport.clone());

    let started = Instant::now();
    let result = h.api.start_generation(single_word()).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(transport.calls().len(), 3);
    assert!(elapsed >= Duration::from_millis(11_500), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(12), "elapsed {elapsed:?}");
    assert_eq!(h.session(&result.session_id).progress, 1);
    assert_eq!(h.store.questions_for_word(1).unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn network_failures_give_up_after_three_retries() {
    let transport = FakeTransport::new();
    transport.script("word1", vec![Reply::Network; 4]);
    let h = Harness::new(3, transport.clone());

    let started = Instant::now();
    let result = h.api.start_generation(single_word()).await.unwrap();

    assert_eq!(transport.calls().len(), 4);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(6), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(6_100), "elapsed {elapsed:?}");
    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(h.session(&result.session_id).progress, 0);

    let errors: Vec<_> = h
        .store
        .logs_for_session(&result.session_id)
        .unwrap()
        .into_iter()
        .filter(|entry| entry.level == LogLevel::Error)
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].word_id(), Some(1));
    assert_eq!(h.api.failure_count(&result.session_id).unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn non_throttle_status_is_not_retried() {
    let transport = FakeTransport::new();
    transport.script("word1", vec![Reply::Status(500, "boom".to_string())]);
    let h = Harness::new(3, transport.clone());

    let started = Instant::now();
    let result = h.api.start_generation(single_word()).await.unwrap();

    assert_eq!(transport.calls().len(), 1);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(h.session(&result.session_id).progress, 0);
}

#[tokio::test]
async fn missing_credentials_fail_each_item_not_the_session() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn GeneratorStore> =
        Arc::new(SledGeneratorStore::open(dir.path().join("store")).unwrap());
    let transport =
        OpenAIClient::new("gpt-test".to_string(), None, "http://127.0.0.1:9", None).unwrap();
    let api = GeneratorApi::new(
        Arc::clone(&store),
        Arc::new(JsonVocabulary::from_items(vocabulary_items(2))),
        Arc::new(CompletionClient::new(
            Arc::new(transport),
            "system",
            RetryPolicy::default(),
        )),
        test_settings(),
        50,
    );

    let result = api
        .start_generation(GenerationRequest {
            limit: 2,
            ..single_word()
        })
        .await
        .unwrap();
    assert_eq!(result.status, SessionStatus::Completed);

    let errors: Vec<String> = store
        .logs_for_session(&result.session_id)
        .unwrap()
        .into_iter()
        .filter(|entry| entry.level == LogLevel::Error)
        .filter_map(|entry| entry.payload["error"].as_str().map(str::to_string))
        .collect();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| e.contains("Provider not configured")));

    let StatusReport::Session(summary) = api.session_status().unwrap() else {
        panic!("expected a session summary");
    };
    assert_eq!(summary.failures, 2);
    assert_eq!(summary.progress, 0);
}
