//! Response Parser
//!
//! Recovers the question array from raw completion text. Models wrap the array
//! in prose or fenced code blocks; the first balanced `[...]` is taken and must
//! decode to exactly the requested number of payloads.

use crate::error::ApiError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One generated quiz question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionPayload {
    #[serde(default)]
    pub word: String,
    /// 1-based position; filled from array order when the model omits it
    #[serde(default)]
    pub pattern_number: Option<u32>,
    pub sentence_en: String,
    pub sentence_ja: String,
    pub choice_1: String,
    pub choice_2: String,
    pub choice_3: String,
    pub choice_4: String,
    pub correct_choice_index: u32,
    #[serde(default)]
    pub feedback_1: String,
    #[serde(default)]
    pub feedback_2: String,
    #[serde(default)]
    pub feedback_3: String,
    #[serde(default)]
    pub feedback_4: String,
    /// Comma separated; a JSON array of strings is joined on input
    #[serde(default, deserialize_with = "tags_from_string_or_list")]
    pub tags: String,
    #[serde(default)]
    pub usage_scene: String,
    #[serde(default)]
    pub embedding_text: String,
}

fn tags_from_string_or_list<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Array(items) => Ok(items
            .iter()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(",")),
        other => Err(serde::de::Error::custom(format!(
            "tags must be a string or list, got {}",
            other
        ))),
    }
}

/// Strip a surrounding fenced code block (```` ``` ```` or ```` ```json ````).
pub fn sanitize_payload(raw: &str) -> &str {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let mut body = &trimmed[3..];
    if body
        .get(..4)
        .is_some_and(|tag| tag.eq_ignore_ascii_case("json"))
    {
        body = &body[4..];
    }
    let body = body.trim_start();
    let body = body.strip_suffix("```").unwrap_or(body);
    body.trim_end()
}

/// Return the first balanced JSON array in `text`.
///
/// Brackets inside JSON string literals do not count toward depth.
pub fn extract_json_array(text: &str) -> Result<&str, ApiError> {
    let start = text
        .find('[')
        .ok_or_else(|| ApiError::InvalidResponse("no JSON array found in response".to_string()))?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, byte) in text.as_bytes()[start..].iter().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }

    Err(ApiError::InvalidResponse(
        "no matching closing bracket for JSON array in response".to_string(),
    ))
}

/// Parse a completion into exactly `pattern_count` payloads.
///
/// No partial acceptance: a short, long or malformed array fails the item.
pub fn parse_response(raw: &str, pattern_count: usize) -> Result<Vec<QuestionPayload>, ApiError> {
    let json_text = extract_json_array(sanitize_payload(raw))?;
    let value: Value = serde_json::from_str(json_text)
        .map_err(|e| ApiError::InvalidResponse(format!("response is not valid JSON: {}", e)))?;
    let Value::Array(items) = value else {
        return Err(ApiError::InvalidResponse(
            "response is not a JSON array".to_string(),
        ));
    };
    if items.len() != pattern_count {
        return Err(ApiError::InvalidResponse(format!(
            "unexpected response length: {} (expected {})",
            items.len(),
            pattern_count
        )));
    }
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            serde_json::from_value::<QuestionPayload>(item).map_err(|e| {
                ApiError::InvalidResponse(format!("question {} is malformed: {}", index + 1, e))
            })
        })
        .collect()
}
