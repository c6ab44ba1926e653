//! Workspace config file source: config/config.toml, then config/{VOCABGEN_ENV}.toml

use config::builder::DefaultState;
use config::ConfigBuilder;
use config::ConfigError;
use config::File;
use std::path::{Path, PathBuf};
use tracing::debug;

const DEFAULT_ENV: &str = "development";

/// Deployment environment name selecting the overlay file.
fn environment_name() -> String {
    std::env::var("VOCABGEN_ENV")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ENV.to_string())
}

/// Workspace files in precedence order, lowest first.
pub fn workspace_config_paths(workspace_root: &Path) -> Vec<PathBuf> {
    let config_dir = workspace_root.join("config");
    vec![
        config_dir.join("config.toml"),
        config_dir.join(format!("{}.toml", environment_name())),
    ]
}

/// Layer the workspace files that exist onto the builder.
pub fn add_to_builder(
    mut builder: ConfigBuilder<DefaultState>,
    workspace_root: &Path,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    for path in workspace_config_paths(workspace_root) {
        if path.exists() {
            debug!(config_path = %path.display(), "Loading workspace configuration");
            builder = builder.add_source(File::from(path).required(false));
        }
    }
    Ok(builder)
}
