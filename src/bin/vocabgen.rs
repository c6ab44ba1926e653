//! vocabgen CLI Binary
//!
//! Command-line interface for the vocabulary question generator.

use anyhow::Context;
use clap::Parser;
use std::process;
use tracing::{error, info};
use vocabgen::cli::{Cli, RunContext};
use vocabgen::config::ConfigLoader;
use vocabgen::error::ApiError;
use vocabgen::logging::{init_logging, LoggingConfig};

fn main() {
    let cli = Cli::parse();

    let logging_config = build_logging_config(&cli);
    if let Err(e) = init_logging(Some(&logging_config)) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    info!("vocabgen starting");

    match run(&cli) {
        Ok(output) => {
            info!("Command completed successfully");
            println!("{}", output);
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            match e.downcast_ref::<ApiError>() {
                Some(api_error) => eprintln!("{}", vocabgen::cli::map_error(api_error)),
                None => eprintln!("{:#}", e),
            }
            process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<String> {
    let context = RunContext::new(cli.workspace.clone(), cli.config.clone())
        .with_context(|| format!("loading workspace {}", cli.workspace.display()))?;
    info!("CLI context initialized");
    Ok(context.execute(&cli.command)?)
}

/// Logging stays off unless `--verbose`; CLI flags override the loaded config.
fn build_logging_config(cli: &Cli) -> LoggingConfig {
    if !cli.verbose {
        return LoggingConfig {
            level: "off".to_string(),
            ..LoggingConfig::default()
        };
    }

    let loaded = match cli.config.as_deref() {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(&cli.workspace),
    };
    // A broken config is reported by the command itself; logging falls back to defaults.
    let mut config = loaded.map(|c| c.logging).unwrap_or_default();

    // CLI arguments take priority
    if let Some(ref level) = cli.log_level {
        config.level = level.clone();
    }
    if let Some(ref format) = cli.log_format {
        config.format = format.clone();
    }
    if let Some(ref output) = cli.log_output {
        config.output = output.clone();
    }
    if let Some(ref file) = cli.log_file {
        config.file = file.clone();
    } else if config.file.is_relative() {
        config.file = cli.workspace.join(&config.file);
    }

    config
}
