//! Session Controller
//!
//! Decides the effective start id, item count and pattern count for a new run,
//! optionally continuing the latest unfinished run, then drives a
//! [`SessionRuntime`] over the matching vocabulary slice.

use crate::completion::CompletionClient;
use crate::error::ApiError;
use crate::session::{RuntimeSettings, SessionRuntime};
use crate::store::{meta, GenerationSession, GeneratorStore, SessionMetadata, SessionStatus};
use crate::types::{clamp_pattern_count, SessionId, WordId};
use crate::vocabulary::VocabularySource;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// A request to start generating
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationRequest {
    pub parallel: usize,
    pub start_word_id: WordId,
    pub limit: usize,
    pub pattern_count: Option<usize>,
    pub resume_existing: bool,
    pub metadata: SessionMetadata,
}

/// Effective parameters for a run
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationPlan {
    pub start_word_id: WordId,
    pub limit: usize,
    pub pattern_count: usize,
    pub resumed: bool,
    pub metadata: SessionMetadata,
}

/// Result of [`SessionController::start_generation`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub session_id: SessionId,
    /// Items dispatched to the session
    pub processed: usize,
    pub start_word_id: WordId,
    pub limit: usize,
    pub pattern_count: usize,
    pub resumed: bool,
    pub status: SessionStatus,
}

/// Work out where a run should start.
///
/// With `resume_existing`, the latest session is continued when it recorded the
/// same start id: an unfinished run resumes at `start + progress` for the
/// remaining count, a completed run advances to `start + limit` for a fresh
/// `request.limit`. Anything else starts fresh.
pub fn plan_generation(
    latest: Option<&GenerationSession>,
    request: &GenerationRequest,
    default_pattern_count: usize,
) -> GenerationPlan {
    let requested_pattern_count = request
        .pattern_count
        .map(clamp_pattern_count)
        .unwrap_or_else(|| clamp_pattern_count(default_pattern_count));

    let mut plan = GenerationPlan {
        start_word_id: request.start_word_id,
        limit: request.limit,
        pattern_count: requested_pattern_count,
        resumed: false,
        metadata: request.metadata.clone(),
    };

    let Some(previous) = latest.filter(|_| request.resume_existing) else {
        return finish_plan(plan);
    };
    // Runs without a recorded start id (regeneration runs) never match.
    let Some(prev_start) = previous.start_word_id() else {
        return finish_plan(plan);
    };
    if prev_start != request.start_word_id {
        return finish_plan(plan);
    }
    let prev_limit = previous
        .limit()
        .filter(|limit| *limit > 0)
        .unwrap_or(request.limit);
    let progress = previous.progress as usize;
    let remaining = prev_limit.saturating_sub(progress);

    if previous.status != SessionStatus::Completed && remaining > 0 {
        plan.start_word_id = prev_start + progress as WordId;
        plan.limit = remaining;
        plan.pattern_count = previous
            .pattern_count()
            .filter(|n| *n > 0)
            .map(clamp_pattern_count)
            .unwrap_or(requested_pattern_count);
    } else if previous.status == SessionStatus::Completed {
        plan.start_word_id = prev_start + prev_limit as WordId;
        plan.limit = request.limit;
    } else {
        return finish_plan(plan);
    }

    plan.resumed = true;
    let metadata = &mut plan.metadata;
    metadata.insert(
        meta::RESUMED_FROM_SESSION_ID.to_string(),
        Value::from(previous.id.clone()),
    );
    metadata.insert(
        meta::RESUME_START_WORD_ID.to_string(),
        Value::from(plan.start_word_id),
    );
    metadata.insert(
        meta::RESUME_SOURCE_START_WORD_ID.to_string(),
        Value::from(prev_start),
    );
    metadata.insert(
        meta::RESUME_SOURCE_LIMIT.to_string(),
        Value::from(prev_limit as u64),
    );
    finish_plan(plan)
}

fn finish_plan(mut plan: GenerationPlan) -> GenerationPlan {
    plan.metadata.insert(
        meta::PATTERN_COUNT.to_string(),
        Value::from(plan.pattern_count as u64),
    );
    plan.metadata.insert(
        meta::START_WORD_ID.to_string(),
        Value::from(plan.start_word_id),
    );
    plan.metadata
        .insert(meta::LIMIT.to_string(), Value::from(plan.limit as u64));
    plan
}

/// Starts generation runs over the vocabulary master list
pub struct SessionController {
    store: Arc<dyn GeneratorStore>,
    vocabulary: Arc<dyn VocabularySource>,
    client: Arc<CompletionClient>,
    settings: RuntimeSettings,
}

impl SessionController {
    pub fn new(
        store: Arc<dyn GeneratorStore>,
        vocabulary: Arc<dyn VocabularySource>,
        client: Arc<CompletionClient>,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            store,
            vocabulary,
            client,
            settings,
        }
    }

    /// Plan and build a runtime without starting it.
    pub fn prepare(
        &self,
        request: &GenerationRequest,
    ) -> Result<(GenerationPlan, SessionRuntime), ApiError> {
        let latest = if request.resume_existing {
            self.store.fetch_latest_session()?
        } else {
            None
        };
        let plan = plan_generation(
            latest.as_ref(),
            request,
            self.settings.default_pattern_count,
        );

        let items = self.vocabulary.slice(plan.start_word_id, plan.limit);
        if items.is_empty() {
            return Err(ApiError::NoVocabulary {
                start_word_id: plan.start_word_id,
                limit: plan.limit,
            });
        }

        let runtime = SessionRuntime::new(
            items,
            plan.metadata.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.client),
            self.settings.clone(),
        );
        runtime.set_parallel_limit(request.parallel)?;
        Ok((plan, runtime))
    }

    /// Start (or resume) a run and wait for it to finish.
    pub async fn start_generation(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResult, ApiError> {
        let (plan, runtime) = self.prepare(&request)?;
        info!(
            start_word_id = plan.start_word_id,
            limit = plan.limit,
            pattern_count = plan.pattern_count,
            resumed = plan.resumed,
            items = runtime.item_count(),
            "Starting generation"
        );
        let dispatched = runtime.item_count();
        let outcome = runtime.start().await?;
        Ok(GenerationResult {
            session_id: outcome.session_id,
            processed: dispatched,
            start_word_id: plan.start_word_id,
            limit: plan.limit,
            pattern_count: plan.pattern_count,
            resumed: plan.resumed,
            status: outcome.status,
        })
    }
}
