//! Vocabulary master list: read-only lookup by id and ordered slices.

use crate::error::ApiError;
use crate::types::WordId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One vocabulary entry. Identity is `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabularyItem {
    pub id: WordId,
    pub word: String,
    #[serde(default)]
    pub part_of_speech: Option<String>,
    #[serde(default)]
    pub difficulty_score: f64,
    #[serde(default)]
    pub meaning_1: Option<String>,
    #[serde(default)]
    pub meaning_2: Option<String>,
    #[serde(default)]
    pub meaning_3: Option<String>,
}

impl VocabularyItem {
    pub fn new(id: WordId, word: impl Into<String>) -> Self {
        Self {
            id,
            word: word.into(),
            part_of_speech: None,
            difficulty_score: 0.0,
            meaning_1: None,
            meaning_2: None,
            meaning_3: None,
        }
    }

    /// Non-blank meanings, trimmed, in order.
    pub fn meanings(&self) -> Vec<String> {
        [&self.meaning_1, &self.meaning_2, &self.meaning_3]
            .into_iter()
            .flatten()
            .map(|m| m.trim())
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Read access to the vocabulary master list
pub trait VocabularySource: Send + Sync {
    fn lookup(&self, id: WordId) -> Option<VocabularyItem>;

    /// Items with `id >= start_id`, ordered by id, at most `count` of them.
    fn slice(&self, start_id: WordId, count: usize) -> Vec<VocabularyItem>;
}

/// In-memory vocabulary, loaded once from a JSON array.
#[derive(Debug, Clone, Default)]
pub struct JsonVocabulary {
    items: BTreeMap<WordId, VocabularyItem>,
}

impl JsonVocabulary {
    pub fn from_items(items: impl IntoIterator<Item = VocabularyItem>) -> Self {
        Self {
            items: items.into_iter().map(|item| (item.id, item)).collect(),
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ApiError> {
        let items: Vec<VocabularyItem> = serde_json::from_str(raw)
            .map_err(|e| ApiError::ConfigError(format!("Invalid vocabulary file: {}", e)))?;
        Ok(Self::from_items(items))
    }

    pub fn load(path: &Path) -> Result<Self, ApiError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ApiError::ConfigError(format!(
                "Failed to read vocabulary file {}: {}",
                path.display(),
                e
            ))
        })?;
        let vocabulary = Self::from_json_str(&raw)?;
        tracing::debug!(path = %path.display(), entries = vocabulary.len(), "Loaded vocabulary");
        Ok(vocabulary)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl VocabularySource for JsonVocabulary {
    fn lookup(&self, id: WordId) -> Option<VocabularyItem> {
        self.items.get(&id).cloned()
    }

    fn slice(&self, start_id: WordId, count: usize) -> Vec<VocabularyItem> {
        self.items
            .range(start_id..)
            .take(count)
            .map(|(_, item)| item.clone())
            .collect()
    }
}
