//! CLI parse: clap types for vocabgen. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// vocabgen - vocabulary question generation orchestrator
#[derive(Parser)]
#[command(name = "vocabgen")]
#[command(about = "Generate multiple-choice vocabulary questions with a chat-completion model")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (default: off)
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate questions for a slice of the vocabulary, continuing the latest run when it matches
    Start {
        /// Concurrent worker loops (1-20, default from config)
        #[arg(long)]
        parallel: Option<usize>,
        /// First vocabulary id of the slice
        #[arg(long, default_value = "1")]
        start_word_id: u64,
        /// Number of vocabulary items in the slice
        #[arg(long, default_value = "100")]
        limit: usize,
        /// Questions per word (1-20, default from config)
        #[arg(long)]
        pattern_count: Option<usize>,
        /// Ignore the latest session and start fresh
        #[arg(long)]
        force_new: bool,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Show the latest session
    Status {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Pause a session
    Pause {
        session_id: String,
    },
    /// Resume a paused or interrupted session
    Resume {
        session_id: String,
        /// Worker loops for a restarted session
        #[arg(long)]
        parallel: Option<usize>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Change the worker loop target of a session
    Parallel {
        session_id: String,
        parallel: usize,
    },
    /// Regeneration queue commands
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Delete all generated questions, logs and sessions
    Reset {
        /// Reason recorded in the log
        #[arg(long)]
        reason: Option<String>,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Audit stored questions, or repair underline markup on named rows
    Validate {
        #[command(subcommand)]
        command: Option<ValidateCommands>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Print the resolved configuration as TOML
    Config,
}

#[derive(Subcommand)]
pub enum ValidateCommands {
    /// Complete `</u` fragments missing their `>`
    FixClosingTag {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Underline the word where the sentence has no `<u>` markup
    FixMissingUnderline {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Strip `<u>` tags from the stored word
    FixWordTag {
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Queue words for regeneration, as `<word_id>` or `<word_id>:<reason>`
    Add {
        #[arg(required = true, allow_hyphen_values = true)]
        entries: Vec<String>,
    },
    /// List visible queue entries, oldest first
    List {
        /// Comma-separated statuses (pending, processing, completed, failed)
        #[arg(long, value_delimiter = ',')]
        status: Vec<String>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Hide queue entries from listings
    Hide {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Regenerate a batch of pending entries
    Process {
        /// Concurrent worker loops (1-20, default from config)
        #[arg(long)]
        parallel: Option<usize>,
        /// Questions per word (1-20, default from config)
        #[arg(long)]
        pattern_count: Option<usize>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
}

/// Parse `<word_id>` or `<word_id>:<reason>`.
pub fn parse_queue_entry(raw: &str) -> Result<(i64, Option<String>), String> {
    let (id, reason) = match raw.split_once(':') {
        Some((id, reason)) => (id, Some(reason.trim().to_string())),
        None => (raw, None),
    };
    let word_id = id
        .trim()
        .parse::<i64>()
        .map_err(|_| format!("invalid word id '{}'", id.trim()))?;
    Ok((word_id, reason.filter(|r| !r.is_empty())))
}
