//! Question audit and underline repairs.
//!
//! The audit scans every stored row for words with too few questions, broken
//! `<u>` markup in the English sentence and vocabulary ids of the latest
//! session that never produced a row. Repairs rewrite only the rows an
//! operator names and report how many changed.

use crate::error::ApiError;
use crate::store::{meta, GeneratedQuestionRow, GeneratorStore, StoredQuestion};
use crate::types::{QuestionId, WordId};
use crate::vocabulary::VocabularySource;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// Cap on each issue list in a report
pub const ISSUE_LIMIT: usize = 30;

const UNKNOWN_WORD: &str = "(unknown word)";

static CLOSING_TAG: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
static UNDERLINE_TAG: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdRange<T> {
    pub min: Option<T>,
    pub max: Option<T>,
}

impl<T: Ord + Clone> IdRange<T> {
    fn of<'a, I>(values: I) -> Self
    where
        I: IntoIterator<Item = &'a T>,
        T: 'a,
    {
        let mut min: Option<T> = None;
        let mut max: Option<T> = None;
        for value in values {
            if min.as_ref().map_or(true, |m| value < m) {
                min = Some(value.clone());
            }
            if max.as_ref().map_or(true, |m| value > m) {
                max = Some(value.clone());
            }
        }
        Self { min, max }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditSummary {
    pub total_questions: usize,
    pub unique_words: usize,
    pub word_id_range: IdRange<WordId>,
    pub question_id_range: IdRange<QuestionId>,
}

/// A word with fewer stored questions than one session writes per word
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WordCount {
    pub word_id: WordId,
    pub word: String,
    pub count: usize,
}

/// What is wrong with a sentence's underline markup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnderlineIssue {
    EmptySentence,
    MissingOpenTag,
    MissingCloseTag,
    Mismatch { underlined: String, word: String },
}

impl fmt::Display for UnderlineIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnderlineIssue::EmptySentence => f.write_str("English sentence is empty"),
            UnderlineIssue::MissingOpenTag => f.write_str("no <u> tag"),
            UnderlineIssue::MissingCloseTag => f.write_str("no </u> tag after <u>"),
            UnderlineIssue::Mismatch { underlined, word } => write!(
                f,
                "underlined text ({}) does not contain the word ({})",
                underlined, word
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagIssue {
    pub id: QuestionId,
    pub word_id: WordId,
    pub word: String,
    pub sentence: String,
    pub issue: UnderlineIssue,
}

/// A vocabulary id in the latest session's range with no stored question
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingWord {
    pub word_id: WordId,
    pub word: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuestionAudit {
    pub summary: AuditSummary,
    /// Per-word question count the under-count check compares against
    pub expected_per_word: usize,
    pub under_count: Vec<WordCount>,
    pub tag_issues: Vec<TagIssue>,
    pub missing_words: Vec<MissingWord>,
}

impl QuestionAudit {
    pub fn is_clean(&self) -> bool {
        self.under_count.is_empty() && self.tag_issues.is_empty() && self.missing_words.is_empty()
    }
}

/// Audits stored questions and applies targeted repairs
pub struct QuestionAuditor {
    store: Arc<dyn GeneratorStore>,
    vocabulary: Arc<dyn VocabularySource>,
    expected_per_word: usize,
}

impl QuestionAuditor {
    pub fn new(
        store: Arc<dyn GeneratorStore>,
        vocabulary: Arc<dyn VocabularySource>,
        expected_per_word: usize,
    ) -> Self {
        Self {
            store,
            vocabulary,
            expected_per_word: expected_per_word.max(1),
        }
    }

    pub fn audit(&self) -> Result<QuestionAudit, ApiError> {
        let rows = self.store.all_questions()?;
        let counts = collapse_word_counts(&rows);

        let summary = AuditSummary {
            total_questions: rows.len(),
            unique_words: counts.len(),
            word_id_range: IdRange::of(rows.iter().map(|q| &q.row.word_id)),
            question_id_range: IdRange::of(rows.iter().map(|q| &q.id)),
        };

        let mut under_count: Vec<WordCount> = counts
            .into_values()
            .filter(|entry| entry.count < self.expected_per_word)
            .collect();
        under_count.sort_by(|a, b| {
            a.word
                .to_lowercase()
                .cmp(&b.word.to_lowercase())
                .then(a.word_id.cmp(&b.word_id))
        });
        under_count.truncate(ISSUE_LIMIT);

        let tag_issues: Vec<TagIssue> = rows
            .iter()
            .filter_map(|q| {
                let issue = check_underline(&q.row.question.sentence_en, &q.row.word)?;
                Some(TagIssue {
                    id: q.id.clone(),
                    word_id: q.row.word_id,
                    word: display_word(&q.row.word),
                    sentence: q.row.question.sentence_en.clone(),
                    issue,
                })
            })
            .take(ISSUE_LIMIT)
            .collect();

        let seen: HashSet<WordId> = rows.iter().map(|q| q.row.word_id).collect();
        let missing_words = self.missing_words(&seen)?;

        info!(
            total_questions = summary.total_questions,
            under_count = under_count.len(),
            tag_issues = tag_issues.len(),
            missing_words = missing_words.len(),
            "Question audit finished"
        );

        Ok(QuestionAudit {
            summary,
            expected_per_word: self.expected_per_word,
            under_count,
            tag_issues,
            missing_words,
        })
    }

    /// Ids the latest session was asked to cover that have no rows.
    fn missing_words(&self, seen: &HashSet<WordId>) -> Result<Vec<MissingWord>, ApiError> {
        let Some(session) = self.store.fetch_latest_session()? else {
            return Ok(Vec::new());
        };
        let start = session
            .start_word_id()
            .or_else(|| session.meta_u64(meta::RESUME_START_WORD_ID));
        let limit = session
            .limit()
            .or_else(|| session.meta_u64(meta::RESUME_SOURCE_LIMIT).map(|v| v as usize));
        let (Some(start), Some(limit)) = (start, limit) else {
            debug!(session_id = %session.id, "Latest session carries no word range");
            return Ok(Vec::new());
        };

        let dispatched = self.vocabulary.slice(start, limit);
        let expected: Vec<(WordId, String)> = if dispatched.is_empty() {
            (start..start.saturating_add(limit as u64))
                .map(|id| (id, format!("word{}", id)))
                .collect()
        } else {
            dispatched.into_iter().map(|item| (item.id, item.word)).collect()
        };

        Ok(expected
            .into_iter()
            .filter(|(id, _)| !seen.contains(id))
            .take(ISSUE_LIMIT)
            .map(|(word_id, word)| MissingWord { word_id, word })
            .collect())
    }

    /// Close `</u` fragments that lost their `>`.
    pub fn fix_closing_tags(&self, ids: &[QuestionId]) -> Result<usize, ApiError> {
        let pattern = cached(&CLOSING_TAG, r"</u>?")?;
        self.repair(ids, "closing_tag", |row| {
            let sentence = &row.question.sentence_en;
            let normalized = pattern.replace_all(sentence, "</u>");
            if normalized == *sentence {
                return Ok(false);
            }
            row.question.sentence_en = normalized.into_owned();
            Ok(true)
        })
    }

    /// Underline the first whole-word occurrence of the row's word in sentences
    /// with no `<u>` yet, cleaning stray tags out of the word itself.
    pub fn fix_missing_underlines(&self, ids: &[QuestionId]) -> Result<usize, ApiError> {
        self.repair(ids, "missing_underline", |row| {
            let original = row.word.trim().to_string();
            let cleaned = strip_underline_tags(&original)?;
            let target = if cleaned.is_empty() { &original } else { &cleaned };
            if target.is_empty() {
                return Ok(false);
            }
            let mut changed = false;
            if !row.question.sentence_en.contains("<u>") {
                if let Some(sentence) = insert_underline(&row.question.sentence_en, target)? {
                    row.question.sentence_en = sentence;
                    changed = true;
                }
            }
            if !cleaned.is_empty() && cleaned != original {
                row.word = cleaned.clone();
                row.question.word = cleaned;
                changed = true;
            }
            Ok(changed)
        })
    }

    /// Remove `<u>`/`</u>` from the stored word.
    pub fn fix_word_tags(&self, ids: &[QuestionId]) -> Result<usize, ApiError> {
        self.repair(ids, "word_tag", |row| {
            let original = row.word.trim().to_string();
            let cleaned = strip_underline_tags(&original)?;
            if cleaned.is_empty() || cleaned == original {
                return Ok(false);
            }
            row.word = cleaned.clone();
            row.question.word = cleaned;
            Ok(true)
        })
    }

    fn repair<F>(&self, ids: &[QuestionId], kind: &str, mut apply: F) -> Result<usize, ApiError>
    where
        F: FnMut(&mut GeneratedQuestionRow) -> Result<bool, ApiError>,
    {
        let ids: Vec<QuestionId> = ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Err(ApiError::InvalidRequest(
                "at least one question id is required".to_string(),
            ));
        }

        let mut updated = 0usize;
        for StoredQuestion { id, mut row } in self.store.questions_by_ids(&ids)? {
            if !apply(&mut row)? {
                continue;
            }
            if self.store.update_question(&id, &row)? {
                debug!(question_id = %id, repair = kind, "Question repaired");
                updated += 1;
            }
        }
        info!(repair = kind, requested = ids.len(), updated, "Question repair applied");
        Ok(updated)
    }
}

fn cached(
    cell: &'static OnceLock<Result<Regex, regex::Error>>,
    pattern: &str,
) -> Result<&'static Regex, ApiError> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(|e| ApiError::InvalidRequest(format!("invalid pattern {}: {}", pattern, e)))
}

fn display_word(word: &str) -> String {
    let trimmed = word.trim();
    if trimmed.is_empty() {
        UNKNOWN_WORD.to_string()
    } else {
        trimmed.to_string()
    }
}

fn collapse_word_counts(rows: &[StoredQuestion]) -> BTreeMap<WordId, WordCount> {
    let mut counts: BTreeMap<WordId, WordCount> = BTreeMap::new();
    for q in rows {
        counts
            .entry(q.row.word_id)
            .or_insert_with(|| WordCount {
                word_id: q.row.word_id,
                word: display_word(&q.row.word),
                count: 0,
            })
            .count += 1;
    }
    counts
}

/// First markup problem in `sentence` for `word`, if any.
pub fn check_underline(sentence: &str, word: &str) -> Option<UnderlineIssue> {
    if sentence.is_empty() {
        return Some(UnderlineIssue::EmptySentence);
    }
    let Some(open) = sentence.find("<u>") else {
        return Some(UnderlineIssue::MissingOpenTag);
    };
    let inner_start = open + "<u>".len();
    let Some(close) = sentence[inner_start..].find("</u>") else {
        return Some(UnderlineIssue::MissingCloseTag);
    };
    let underlined = sentence[inner_start..inner_start + close].trim().to_lowercase();
    let target = word.trim().to_lowercase();
    if !target.is_empty() && !underlined.contains(&target) {
        return Some(UnderlineIssue::Mismatch {
            underlined,
            word: target,
        });
    }
    None
}

/// Wrap the first case-insensitive whole-word match of `target` in `<u>`.
/// `None` when the word does not occur.
pub fn insert_underline(sentence: &str, target: &str) -> Result<Option<String>, ApiError> {
    let pattern = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(target)))
        .map_err(|e| ApiError::InvalidRequest(format!("cannot match word {}: {}", target, e)))?;
    Ok(pattern.find(sentence).map(|m| {
        format!(
            "{}<u>{}</u>{}",
            &sentence[..m.start()],
            m.as_str(),
            &sentence[m.end()..]
        )
    }))
}

pub fn strip_underline_tags(word: &str) -> Result<String, ApiError> {
    let pattern = cached(&UNDERLINE_TAG, r"(?i)</?u>")?;
    Ok(pattern.replace_all(word, "").trim().to_string())
}
