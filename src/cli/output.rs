//! CLI output: error mapping from domain errors to the CLI surface.

use crate::error::ApiError;

/// Map domain errors to a string for CLI output, with a hint where one helps.
pub fn map_error(e: &ApiError) -> String {
    match e {
        ApiError::ProviderNotConfigured(_) => format!(
            "{}\nSet provider.api_key in config/config.toml or export OPENAI_API_KEY.",
            e
        ),
        ApiError::NoVocabulary { .. } => format!(
            "{}\nCheck storage.vocabulary_path and the requested id range.",
            e
        ),
        ApiError::SessionNotFound(_) => format!("{}\nRun `vocabgen status` to see the latest session.", e),
        _ => e.to_string(),
    }
}
