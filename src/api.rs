//! Generator API
//!
//! Single entry point bundling the store, the vocabulary, the completion client
//! and the runtime settings. The CLI and embedding applications call this.

use crate::completion::{CompletionClient, RetryPolicy};
use crate::config::GeneratorConfig;
use crate::control::{ControlPlane, ResumeDecision, StatusReport};
use crate::controller::{GenerationPlan, GenerationRequest, GenerationResult, SessionController};
use crate::error::ApiError;
use crate::provider::{CompletionTransport, OpenAIClient};
use crate::regeneration::{RegenerationOutcome, RegenerationProcessor, RegenerationRequest};
use crate::session::{RuntimeSettings, SessionRuntime};
use crate::store::{
    GeneratorStore, QueueStatus, RegenerationQueueEntry, ResetSummary, SledGeneratorStore,
};
use crate::types::{QuestionId, QueueEntryId, SessionId};
use crate::validate::{QuestionAudit, QuestionAuditor};
use crate::vocabulary::{JsonVocabulary, VocabularySource};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Outcome of a resume request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeReport {
    pub resumed: bool,
    pub new_session_started: bool,
    pub previous_session_id: Option<SessionId>,
    pub session_id: Option<SessionId>,
    /// Items dispatched to a newly started session
    pub processed: usize,
    pub message: Option<String>,
}

pub struct GeneratorApi {
    store: Arc<dyn GeneratorStore>,
    controller: SessionController,
    regeneration: RegenerationProcessor,
    control: ControlPlane,
    auditor: QuestionAuditor,
}

impl GeneratorApi {
    pub fn new(
        store: Arc<dyn GeneratorStore>,
        vocabulary: Arc<dyn VocabularySource>,
        client: Arc<CompletionClient>,
        settings: RuntimeSettings,
        regeneration_batch_limit: usize,
    ) -> Self {
        let controller = SessionController::new(
            Arc::clone(&store),
            Arc::clone(&vocabulary),
            Arc::clone(&client),
            settings.clone(),
        );
        let auditor = QuestionAuditor::new(
            Arc::clone(&store),
            Arc::clone(&vocabulary),
            settings.default_pattern_count,
        );
        let regeneration = RegenerationProcessor::new(
            Arc::clone(&store),
            Arc::clone(&vocabulary),
            client,
            settings,
            regeneration_batch_limit,
        );
        let control = ControlPlane::new(Arc::clone(&store), vocabulary);
        Self {
            store,
            controller,
            regeneration,
            control,
            auditor,
        }
    }

    /// Wire every collaborator from configuration.
    pub fn from_config(config: &GeneratorConfig, workspace_root: &Path) -> Result<Self, ApiError> {
        let storage = config.storage.resolve(workspace_root);
        if let Some(parent) = storage.store_path.parent() {
            std::fs::create_dir_all(parent).map_err(crate::error::StorageError::from)?;
        }
        let store: Arc<dyn GeneratorStore> =
            Arc::new(SledGeneratorStore::open(&storage.store_path)?);
        let vocabulary: Arc<dyn VocabularySource> =
            Arc::new(JsonVocabulary::load(&storage.vocabulary_path)?);
        let transport: Arc<dyn CompletionTransport> =
            Arc::new(OpenAIClient::from_config(&config.provider)?);
        Ok(Self::with_transport(config, workspace_root, store, vocabulary, transport))
    }

    /// Wire from configuration around caller-supplied collaborators.
    pub fn with_transport(
        config: &GeneratorConfig,
        workspace_root: &Path,
        store: Arc<dyn GeneratorStore>,
        vocabulary: Arc<dyn VocabularySource>,
        transport: Arc<dyn CompletionTransport>,
    ) -> Self {
        let system_prompt = config.provider.load_system_prompt(workspace_root);
        let client = Arc::new(CompletionClient::new(
            transport,
            system_prompt,
            RetryPolicy::from_config(&config.generation),
        ));
        info!(
            model = client.model_name(),
            store = %config.storage.store_path.display(),
            "Generator API initialized"
        );
        Self::new(
            store,
            vocabulary,
            client,
            RuntimeSettings::from_config(config),
            config.generation.regeneration_batch_limit,
        )
    }

    pub fn store(&self) -> &Arc<dyn GeneratorStore> {
        &self.store
    }

    pub async fn start_generation(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResult, ApiError> {
        self.controller.start_generation(request).await
    }

    /// Build a runtime without starting it, for callers that steer it in-process.
    pub fn prepare_generation(
        &self,
        request: &GenerationRequest,
    ) -> Result<(GenerationPlan, SessionRuntime), ApiError> {
        self.controller.prepare(request)
    }

    pub fn pause_session(&self, session_id: &str) -> Result<(), ApiError> {
        self.control.pause_session(session_id)
    }

    pub fn set_session_parallel(&self, session_id: &str, parallel: usize) -> Result<usize, ApiError> {
        self.control.set_session_parallel(session_id, parallel)
    }

    /// Resume a session: unpause in place, or restart the remaining slice as a
    /// new session and wait for it.
    pub async fn resume_session(
        &self,
        session_id: &str,
        parallel: Option<usize>,
    ) -> Result<ResumeReport, ApiError> {
        match self.control.resume_session(session_id, parallel)? {
            ResumeDecision::Restart {
                previous_session_id,
                request,
            } => {
                let result = self.controller.start_generation(request).await?;
                Ok(ResumeReport {
                    resumed: true,
                    new_session_started: true,
                    previous_session_id: Some(previous_session_id),
                    session_id: Some(result.session_id),
                    processed: result.processed,
                    message: None,
                })
            }
            decision => Ok(in_place_report(session_id, decision)),
        }
    }

    /// Resume a paused session in place; never starts a new session.
    pub fn unpause_session(&self, session_id: &str) -> Result<ResumeReport, ApiError> {
        let decision = self.control.unpause_session(session_id)?;
        Ok(in_place_report(session_id, decision))
    }

    pub fn session_status(&self) -> Result<StatusReport, ApiError> {
        self.control.session_status()
    }

    pub fn failure_count(&self, session_id: &str) -> Result<usize, ApiError> {
        self.control.failure_count(session_id)
    }

    pub fn reset_generator_data(&self, reason: Option<&str>) -> Result<ResetSummary, ApiError> {
        self.control.reset_generator_data(reason)
    }

    pub fn add_to_regeneration_queue(
        &self,
        requests: &[RegenerationRequest],
    ) -> Result<Vec<RegenerationQueueEntry>, ApiError> {
        self.regeneration.add(requests)
    }

    pub fn list_regeneration_queue(
        &self,
        statuses: Option<&[QueueStatus]>,
    ) -> Result<Vec<RegenerationQueueEntry>, ApiError> {
        self.regeneration.list(statuses)
    }

    pub fn hide_regeneration_queue_entries(&self, ids: &[QueueEntryId]) -> Result<usize, ApiError> {
        self.regeneration.hide(ids)
    }

    pub async fn process_regeneration_queue(
        &self,
        parallel: usize,
        pattern_count: usize,
    ) -> Result<RegenerationOutcome, ApiError> {
        self.regeneration.process(parallel, pattern_count).await
    }

    /// Audit every stored question for counts, underline markup and gaps.
    pub fn validate_questions(&self) -> Result<QuestionAudit, ApiError> {
        self.auditor.audit()
    }

    pub fn fix_closing_tags(&self, ids: &[QuestionId]) -> Result<usize, ApiError> {
        self.auditor.fix_closing_tags(ids)
    }

    pub fn fix_missing_underlines(&self, ids: &[QuestionId]) -> Result<usize, ApiError> {
        self.auditor.fix_missing_underlines(ids)
    }

    pub fn fix_word_tags(&self, ids: &[QuestionId]) -> Result<usize, ApiError> {
        self.auditor.fix_word_tags(ids)
    }
}

/// Report for decisions that never start a new session.
fn in_place_report(session_id: &str, decision: ResumeDecision) -> ResumeReport {
    let (resumed, previous_session_id, current, message) = match decision {
        ResumeDecision::Unpaused => (true, None, Some(session_id.to_string()), None),
        ResumeDecision::AlreadyRunning => (
            false,
            None,
            Some(session_id.to_string()),
            Some("session already running".to_string()),
        ),
        ResumeDecision::NothingRemaining(message) => {
            (false, Some(session_id.to_string()), None, Some(message))
        }
        ResumeDecision::Restart {
            previous_session_id, ..
        } => (
            false,
            Some(previous_session_id),
            None,
            Some("remaining words need a new session".to_string()),
        ),
    };
    ResumeReport {
        resumed,
        new_session_started: false,
        previous_session_id,
        session_id: current,
        processed: 0,
        message,
    }
}
