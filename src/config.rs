//! Configuration System
//!
//! Layered configuration: built-in defaults, the global config file, workspace
//! config files, then `VOCABGEN__SECTION__KEY` environment overrides.

use crate::error::ApiError;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use crate::provider::ProviderConfig;

mod merge {
    pub mod merge_policy;
}
mod sources {
    pub mod global_file;
    pub mod workspace_file;
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Completion service settings
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Worker pool and retry settings
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Storage paths
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker pool, retry and regeneration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Loop count used when a caller does not pass one
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Items dequeued together by one worker loop
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Question payloads requested per vocabulary item
    #[serde(default = "default_questions_per_word")]
    pub questions_per_word: usize,
    /// Category tags offered to the model
    #[serde(default = "default_tag_pool")]
    pub tag_pool: Vec<String>,
    /// Interval between persisted-status polls while paused (milliseconds)
    #[serde(default = "default_pause_poll_ms")]
    pub pause_poll_ms: u64,
    /// Retries after the first completion attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Wait after a throttled response without a server hint (milliseconds)
    #[serde(default = "default_retry_delay_ms")]
    pub default_retry_delay_ms: u64,
    /// Wait after a network failure (milliseconds)
    #[serde(default = "default_network_retry_delay_ms")]
    pub network_retry_delay_ms: u64,
    /// Pending regeneration entries claimed per processing run
    #[serde(default = "default_regeneration_batch_limit")]
    pub regeneration_batch_limit: usize,
}

fn default_max_parallel() -> usize {
    2
}

fn default_batch_size() -> usize {
    5
}

fn default_questions_per_word() -> usize {
    10
}

fn default_tag_pool() -> Vec<String> {
    vec![
        "daily_life".to_string(),
        "education".to_string(),
        "action".to_string(),
    ]
}

fn default_pause_poll_ms() -> u64 {
    2_000
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    10_000
}

fn default_network_retry_delay_ms() -> u64 {
    2_000
}

fn default_regeneration_batch_limit() -> usize {
    50
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            batch_size: default_batch_size(),
            questions_per_word: default_questions_per_word(),
            tag_pool: default_tag_pool(),
            pause_poll_ms: default_pause_poll_ms(),
            max_retries: default_max_retries(),
            default_retry_delay_ms: default_retry_delay_ms(),
            network_retry_delay_ms: default_network_retry_delay_ms(),
            regeneration_batch_limit: default_regeneration_batch_limit(),
        }
    }
}

impl GenerationConfig {
    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be at least 1".to_string());
        }
        if self.pause_poll_ms == 0 {
            return Err("pause_poll_ms must be at least 1".to_string());
        }
        if self.regeneration_batch_limit == 0 {
            return Err("regeneration_batch_limit must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Storage paths, relative paths resolve against the workspace root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default = "default_vocabulary_path")]
    pub vocabulary_path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".vocabgen/store")
}

fn default_vocabulary_path() -> PathBuf {
    PathBuf::from("data/vocabulary.json")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            vocabulary_path: default_vocabulary_path(),
        }
    }
}

impl StorageConfig {
    pub fn resolve(&self, workspace_root: &Path) -> StorageConfig {
        let join = |p: &PathBuf| {
            if p.is_absolute() {
                p.clone()
            } else {
                workspace_root.join(p)
            }
        };
        StorageConfig {
            store_path: join(&self.store_path),
            vocabulary_path: join(&self.vocabulary_path),
        }
    }

    /// File advertising the control listener of the process holding the store.
    pub fn control_address_path(&self) -> PathBuf {
        self.store_path.with_file_name("control.addr")
    }
}

/// Configuration validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    Provider(String),
    Generation(String),
    Storage(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Provider(msg) => write!(f, "Provider: {}", msg),
            ValidationError::Generation(msg) => write!(f, "Generation: {}", msg),
            ValidationError::Storage(msg) => write!(f, "Storage: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl GeneratorConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = self.provider.validate() {
            errors.push(ValidationError::Provider(e));
        }
        if let Err(e) = self.generation.validate() {
            errors.push(ValidationError::Generation(e));
        }
        if self.storage.store_path.as_os_str().is_empty() {
            errors.push(ValidationError::Storage(
                "Store path cannot be empty".to_string(),
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Loads `GeneratorConfig` from its layered sources.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate the configuration for a workspace.
    pub fn load(workspace_root: &Path) -> Result<GeneratorConfig, ApiError> {
        let builder = merge::merge_policy::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder)?;
        let builder = sources::workspace_file::add_to_builder(builder, workspace_root)?;
        Self::finish(builder)
    }

    /// Load from an explicit file; global and workspace files are skipped.
    pub fn load_from_file(path: &Path) -> Result<GeneratorConfig, ApiError> {
        if !path.exists() {
            return Err(ApiError::ConfigError(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }
        let builder = merge::merge_policy::builder_with_defaults()?
            .add_source(config::File::from(path.to_path_buf()));
        Self::finish(builder)
    }

    pub fn global_config_path() -> Option<PathBuf> {
        sources::global_file::global_config_path()
    }

    fn finish(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<GeneratorConfig, ApiError> {
        let config: GeneratorConfig = builder
            .add_source(
                config::Environment::with_prefix("VOCABGEN")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("generation.tag_pool"),
            )
            .build()?
            .try_deserialize()?;

        config.validate().map_err(|errors| {
            let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            ApiError::ConfigError(format!(
                "Configuration validation failed:\n{}",
                msgs.join("\n")
            ))
        })?;

        Ok(config)
    }
}
