//! CLI route: single route table and run context. Dispatches to the generator API and presentation.

use crate::api::GeneratorApi;
use crate::cli::parse::{parse_queue_entry, Commands, QueueCommands, ValidateCommands};
use crate::cli::presentation::{
    format_generation_result, format_question_audit, format_queue_added, format_queue_entries,
    format_regeneration_outcome, format_repair_result, format_reset_summary,
    format_resume_report, format_status_report,
};
use crate::config::{ConfigLoader, GeneratorConfig};
use crate::control_channel::{ControlClient, ControlReply, ControlRequest, ControlServer};
use crate::controller::GenerationRequest;
use crate::error::ApiError;
use crate::regeneration::RegenerationRequest;
use crate::store::{QueueStatus, SessionMetadata};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Runtime context for CLI execution: workspace, resolved configuration and
/// the async runtime the generator runs on.
pub struct RunContext {
    workspace_root: PathBuf,
    config: GeneratorConfig,
    runtime: tokio::runtime::Runtime,
}

impl RunContext {
    /// Create run context from workspace root and optional config path. Uses ConfigLoader only.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> Result<Self, ApiError> {
        let config = if let Some(ref cfg_path) = config_path {
            ConfigLoader::load_from_file(cfg_path)?
        } else {
            ConfigLoader::load(&workspace_root)?
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| ApiError::ConfigError(format!("Failed to create runtime: {}", e)))?;
        Ok(Self {
            workspace_root,
            config,
            runtime,
        })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    fn open_api(&self) -> Result<Arc<GeneratorApi>, ApiError> {
        GeneratorApi::from_config(&self.config, &self.workspace_root).map(Arc::new)
    }

    fn control_address_path(&self) -> PathBuf {
        self.config
            .storage
            .resolve(&self.workspace_root)
            .control_address_path()
    }

    /// Drive a long run while serving live control requests for it.
    fn run_controlled<F, T>(&self, api: &Arc<GeneratorApi>, run: F) -> Result<T, ApiError>
    where
        F: Future<Output = Result<T, ApiError>>,
    {
        self.runtime.block_on(async {
            let _server =
                match ControlServer::start(Arc::clone(api), self.control_address_path()).await {
                    Ok(server) => Some(server),
                    Err(e) => {
                        warn!(error = %e, "Live control unavailable for this run");
                        None
                    }
                };
            run.await
        })
    }

    /// Forward an operator command to a process already running generation.
    /// `None` when no such process is reachable.
    fn forward_to_live_run(&self, command: &Commands) -> Result<Option<String>, ApiError> {
        let request = match command {
            Commands::Pause { session_id } => ControlRequest::Pause {
                session_id: session_id.clone(),
            },
            Commands::Resume { session_id, .. } => ControlRequest::Resume {
                session_id: session_id.clone(),
            },
            Commands::Parallel {
                session_id,
                parallel,
            } => ControlRequest::Parallel {
                session_id: session_id.clone(),
                parallel: *parallel,
            },
            Commands::Status { .. } => ControlRequest::Status,
            _ => return Ok(None),
        };
        let address_file = self.control_address_path();
        let reply = self.runtime.block_on(async {
            match ControlClient::connect(&address_file).await {
                Some(mut client) => client.request(&request).await.map(Some),
                None => Ok(None),
            }
        })?;
        let Some(reply) = reply else {
            return Ok(None);
        };
        info!(?request, "Command served by the running generator");

        let output = match (command, reply) {
            (Commands::Pause { session_id }, ControlReply::Paused) => {
                format!("Session {} paused", session_id)
            }
            (Commands::Resume { format, .. }, ControlReply::Resumed { report }) => {
                format_resume_report(&report, format)?
            }
            (Commands::Parallel { session_id, .. }, ControlReply::Parallel { applied }) => {
                format!("Session {} parallel set to {}", session_id, applied)
            }
            (Commands::Status { format }, ControlReply::Status { report }) => {
                format_status_report(&report, format)?
            }
            (_, reply) => {
                return Err(ApiError::ControlChannel(format!(
                    "unexpected reply {:?}",
                    reply
                )))
            }
        };
        Ok(Some(output))
    }

    /// Execute a CLI command via the single route table.
    pub fn execute(&self, command: &Commands) -> Result<String, ApiError> {
        if let Commands::Config = command {
            return self.handle_config();
        }
        if let Some(output) = self.forward_to_live_run(command)? {
            return Ok(output);
        }
        let api = self.open_api()?;
        match command {
            Commands::Start {
                parallel,
                start_word_id,
                limit,
                pattern_count,
                force_new,
                format,
            } => {
                let request = GenerationRequest {
                    parallel: parallel.unwrap_or(self.config.generation.max_parallel),
                    start_word_id: *start_word_id,
                    limit: *limit,
                    pattern_count: *pattern_count,
                    resume_existing: !*force_new,
                    metadata: SessionMetadata::new(),
                };
                let result = self.run_controlled(&api, api.start_generation(request))?;
                format_generation_result(&result, format)
            }
            Commands::Status { format } => format_status_report(&api.session_status()?, format),
            Commands::Pause { session_id } => {
                api.pause_session(session_id)?;
                Ok(format!("Session {} paused", session_id))
            }
            Commands::Resume {
                session_id,
                parallel,
                format,
            } => {
                let report =
                    self.run_controlled(&api, api.resume_session(session_id, *parallel))?;
                format_resume_report(&report, format)
            }
            Commands::Parallel {
                session_id,
                parallel,
            } => {
                let applied = api.set_session_parallel(session_id, *parallel)?;
                Ok(format!("Session {} parallel set to {}", session_id, applied))
            }
            Commands::Queue { command } => self.handle_queue_command(&api, command),
            Commands::Reset { reason, yes } => self.handle_reset(&api, reason.as_deref(), *yes),
            Commands::Validate { command, format } => {
                self.handle_validate(&api, command.as_ref(), format)
            }
            Commands::Config => self.handle_config(),
        }
    }

    fn handle_queue_command(
        &self,
        api: &Arc<GeneratorApi>,
        command: &QueueCommands,
    ) -> Result<String, ApiError> {
        match command {
            QueueCommands::Add { entries } => {
                let requests = entries
                    .iter()
                    .map(|raw| {
                        parse_queue_entry(raw).map(|(word_id, reason)| RegenerationRequest {
                            word_id,
                            word: None,
                            reason,
                        })
                    })
                    .collect::<Result<Vec<_>, String>>()
                    .map_err(ApiError::RegenerationFailed)?;
                let inserted = api.add_to_regeneration_queue(&requests)?;
                Ok(format_queue_added(requests.len(), &inserted))
            }
            QueueCommands::List { status, format } => {
                let statuses = status
                    .iter()
                    .map(|s| s.parse::<QueueStatus>())
                    .collect::<Result<Vec<_>, String>>()
                    .map_err(ApiError::ConfigError)?;
                let filter = (!statuses.is_empty()).then_some(statuses.as_slice());
                let entries = api.list_regeneration_queue(filter)?;
                format_queue_entries(&entries, format)
            }
            QueueCommands::Hide { ids } => {
                let hidden = api.hide_regeneration_queue_entries(ids)?;
                Ok(format!("Hid {} queue entr{}", hidden, if hidden == 1 { "y" } else { "ies" }))
            }
            QueueCommands::Process {
                parallel,
                pattern_count,
                format,
            } => {
                let parallel = parallel.unwrap_or(self.config.generation.max_parallel);
                let pattern_count =
                    pattern_count.unwrap_or(self.config.generation.questions_per_word);
                let outcome = self.run_controlled(
                    api,
                    api.process_regeneration_queue(parallel, pattern_count),
                )?;
                format_regeneration_outcome(&outcome, format)
            }
        }
    }

    fn handle_validate(
        &self,
        api: &GeneratorApi,
        command: Option<&ValidateCommands>,
        format: &str,
    ) -> Result<String, ApiError> {
        let (repair, updated) = match command {
            None => return format_question_audit(&api.validate_questions()?, format),
            Some(ValidateCommands::FixClosingTag { ids }) => {
                ("closing tag", api.fix_closing_tags(ids)?)
            }
            Some(ValidateCommands::FixMissingUnderline { ids }) => {
                ("missing underline", api.fix_missing_underlines(ids)?)
            }
            Some(ValidateCommands::FixWordTag { ids }) => ("word tag", api.fix_word_tags(ids)?),
        };
        format_repair_result(repair, updated, format)
    }

    fn handle_reset(
        &self,
        api: &GeneratorApi,
        reason: Option<&str>,
        yes: bool,
    ) -> Result<String, ApiError> {
        if !yes {
            use dialoguer::Confirm;
            let confirmed = Confirm::new()
                .with_prompt("Delete all generated questions, logs and sessions?")
                .default(false)
                .interact()
                .map_err(|e| ApiError::ConfigError(format!("Failed to get user input: {}", e)))?;

            if !confirmed {
                return Ok("Reset cancelled".to_string());
            }
        }
        let summary = api.reset_generator_data(reason)?;
        info!(
            questions = summary.questions_deleted,
            logs = summary.logs_deleted,
            sessions = summary.sessions_deleted,
            "Generator data reset"
        );
        Ok(format_reset_summary(&summary))
    }

    fn handle_config(&self) -> Result<String, ApiError> {
        let mut shown = self.config.clone();
        if shown.provider.api_key.is_some() {
            shown.provider.api_key = Some("********".to_string());
        }
        toml::to_string_pretty(&shown)
            .map_err(|e| ApiError::ConfigError(format!("Failed to render configuration: {}", e)))
    }
}
