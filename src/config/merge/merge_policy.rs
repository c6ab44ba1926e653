//! Merge rules: built-in defaults applied beneath every file and env source.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("provider.base_url", "https://api.openai.com")?
        .set_default("provider.model", "gpt-5-mini")?
        .set_default("provider.conversation_word_limit", 10)?
        .set_default("generation.max_parallel", 2)?
        .set_default("generation.batch_size", 5)?
        .set_default("generation.questions_per_word", 10)?
        .set_default("storage.store_path", ".vocabgen/store")?
        .set_default("storage.vocabulary_path", "data/vocabulary.json")
}
