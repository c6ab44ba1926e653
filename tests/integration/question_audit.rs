//! Integration tests for the question audit and underline repairs

use crate::integration::test_utils::{question_array, FakeTransport, Harness};
use serde_json::json;
use vocabgen::controller::GenerationRequest;
use vocabgen::error::ApiError;
use vocabgen::parser::parse_response;
use vocabgen::store::{GeneratedQuestionRow, GeneratorStore, SessionMetadata};
use vocabgen::validate::{UnderlineIssue, ISSUE_LIMIT};

fn insert_row(store: &dyn GeneratorStore, word_id: u64, word: &str, sentence: &str) {
    let mut question = parse_response(&question_array(word, 1), 1)
        .unwrap()
        .remove(0);
    question.sentence_en = sentence.to_string();
    store
        .insert_question(&GeneratedQuestionRow {
            session_id: "sess-audit".to_string(),
            word_id,
            word: word.to_string(),
            pattern_number: 1,
            question,
            created_at_ms: 1,
        })
        .unwrap();
}

fn id_of(h: &Harness, word_id: u64) -> String {
    h.store
        .all_questions()
        .unwrap()
        .into_iter()
        .find(|q| q.row.word_id == word_id)
        .unwrap()
        .id
}

#[tokio::test]
async fn generated_rows_without_markup_are_flagged_then_repaired() {
    let h = Harness::new(3, FakeTransport::new());
    h.api
        .start_generation(GenerationRequest {
            parallel: 2,
            start_word_id: 1,
            limit: 3,
            pattern_count: Some(2),
            resume_existing: false,
            metadata: SessionMetadata::new(),
        })
        .await
        .unwrap();

    let audit = h.api.validate_questions().unwrap();
    assert_eq!(audit.summary.total_questions, 6);
    assert_eq!(audit.summary.unique_words, 3);
    assert_eq!(audit.summary.word_id_range.min, Some(1));
    assert_eq!(audit.summary.word_id_range.max, Some(3));
    assert!(audit.under_count.is_empty());
    assert!(audit.missing_words.is_empty());
    assert_eq!(audit.tag_issues.len(), 6);
    assert!(audit
        .tag_issues
        .iter()
        .all(|issue| issue.issue == UnderlineIssue::MissingOpenTag));

    let ids: Vec<String> = audit.tag_issues.iter().map(|i| i.id.clone()).collect();
    assert_eq!(h.api.fix_missing_underlines(&ids).unwrap(), 6);

    let sentences: Vec<String> = h
        .store
        .questions_for_word(2)
        .unwrap()
        .into_iter()
        .map(|row| row.question.sentence_en)
        .collect();
    assert!(sentences.contains(&"Sentence 1 for <u>word2</u>".to_string()));
    assert!(sentences.contains(&"Sentence 2 for <u>word2</u>".to_string()));
    assert!(h.api.validate_questions().unwrap().is_clean());

    // A second pass finds nothing left to change.
    assert_eq!(h.api.fix_missing_underlines(&ids).unwrap(), 0);
}

#[test]
fn audit_reports_short_words_and_ids_missing_from_the_latest_range() {
    let h = Harness::new(6, FakeTransport::new());
    h.store
        .create_session(
            1,
            json!({ "start_word_id": 2, "limit": 4 })
                .as_object()
                .cloned()
                .unwrap(),
        )
        .unwrap();
    insert_row(h.store.as_ref(), 2, "word2", "A <u>word2</u> here.");
    insert_row(h.store.as_ref(), 2, "word2", "Another <u>word2</u>.");
    insert_row(h.store.as_ref(), 4, "word4", "Only <u>word4</u>.");

    let audit = h.api.validate_questions().unwrap();
    assert_eq!(audit.expected_per_word, 2);
    assert_eq!(audit.under_count.len(), 1);
    assert_eq!(audit.under_count[0].word_id, 4);
    assert_eq!(audit.under_count[0].count, 1);
    assert_eq!(
        audit
            .missing_words
            .iter()
            .map(|m| (m.word_id, m.word.as_str()))
            .collect::<Vec<_>>(),
        vec![(3, "word3"), (5, "word5")]
    );
    assert!(audit.tag_issues.is_empty());
}

#[test]
fn tag_issue_list_is_capped() {
    let h = Harness::new(1, FakeTransport::new());
    for word_id in 1..=(ISSUE_LIMIT as u64 + 5) {
        insert_row(h.store.as_ref(), word_id, "run", "No markup at all.");
    }
    let audit = h.api.validate_questions().unwrap();
    assert_eq!(audit.summary.total_questions, ISSUE_LIMIT + 5);
    assert_eq!(audit.tag_issues.len(), ISSUE_LIMIT);
    assert_eq!(audit.under_count.len(), ISSUE_LIMIT);
}

#[test]
fn closing_and_word_tag_repairs_touch_only_named_rows() {
    let h = Harness::new(3, FakeTransport::new());
    insert_row(h.store.as_ref(), 1, "run", "I <u>run</u daily.");
    insert_row(h.store.as_ref(), 2, "<u>walk</u>", "I <u>walk</u daily.");
    let run_id = id_of(&h, 1);
    let walk_id = id_of(&h, 2);

    let audit = h.api.validate_questions().unwrap();
    assert_eq!(audit.tag_issues.len(), 2);
    assert!(audit
        .tag_issues
        .iter()
        .all(|issue| issue.issue == UnderlineIssue::MissingCloseTag));

    assert_eq!(h.api.fix_closing_tags(&[run_id.clone()]).unwrap(), 1);
    assert_eq!(h.api.fix_closing_tags(&[run_id.clone()]).unwrap(), 0);
    let run = &h.store.questions_for_word(1).unwrap()[0];
    assert_eq!(run.question.sentence_en, "I <u>run</u> daily.");
    let walk = &h.store.questions_for_word(2).unwrap()[0];
    assert_eq!(walk.question.sentence_en, "I <u>walk</u daily.");

    assert_eq!(
        h.api
            .fix_word_tags(&[walk_id.clone(), "no-such-id".to_string()])
            .unwrap(),
        1
    );
    let walk = &h.store.questions_for_word(2).unwrap()[0];
    assert_eq!(walk.word, "walk");
    assert_eq!(walk.question.word, "walk");
    assert_eq!(h.api.fix_word_tags(&[run_id]).unwrap(), 0);
}

#[test]
fn repairs_need_at_least_one_id() {
    let h = Harness::new(1, FakeTransport::new());
    for result in [
        h.api.fix_closing_tags(&[]),
        h.api.fix_missing_underlines(&["  ".to_string()]),
        h.api.fix_word_tags(&[]),
    ] {
        assert!(matches!(result, Err(ApiError::InvalidRequest(_))));
    }
}
