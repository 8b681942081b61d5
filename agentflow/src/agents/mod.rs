//! Agent stages: each turns the current shared state into one generation
//! request, then turns the generated text into a partial state update.
//!
//! Stages never await anything themselves. The orchestrator owns the single
//! suspension point (the generation call) so timeouts and cancellation stay
//! out of stage logic.

use thiserror::Error;

use crate::core::invariants::missing_inputs;
use crate::core::state::SharedState;
use crate::core::state_update::StateDelta;
use crate::core::types::{StageName, StateField};
use crate::io::config::StageTemperatures;
use crate::io::generator::{GenerationError, GenerationRequest};
use crate::io::prompt::PromptBuilder;

pub mod executor;
pub mod planner;
pub mod researcher;
pub mod validator;

/// Failure that stops a run with reason `stage_failure`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StageError {
    #[error("{stage} ran before '{field}' was produced")]
    MissingInput { stage: StageName, field: StateField },
    #[error("{stage} prompt could not be rendered: {message}")]
    Prompt { stage: StageName, message: String },
    #[error("{stage} generation failed: {source}")]
    Generation {
        stage: StageName,
        #[source]
        source: GenerationError,
    },
    #[error("{stage} not started: run time budget exhausted")]
    RunTimedOut { stage: StageName },
}

impl StageError {
    pub fn stage(&self) -> StageName {
        match self {
            StageError::MissingInput { stage, .. }
            | StageError::Prompt { stage, .. }
            | StageError::Generation { stage, .. }
            | StageError::RunTimedOut { stage } => *stage,
        }
    }

    /// Whether the underlying generation failure might not recur.
    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Generation { source, .. } if source.is_transient())
    }
}

/// The closed set of stages and the settings they share.
#[derive(Debug, Clone)]
pub struct StageSet {
    prompts: PromptBuilder,
    temperatures: StageTemperatures,
    max_retries: u32,
}

impl StageSet {
    pub fn new(prompts: PromptBuilder, temperatures: StageTemperatures, max_retries: u32) -> Self {
        Self {
            prompts,
            temperatures,
            max_retries,
        }
    }

    /// Build the generation request `stage` sends for `state`.
    pub fn request(
        &self,
        stage: StageName,
        state: &SharedState,
    ) -> Result<GenerationRequest, StageError> {
        if let Some(field) = missing_inputs(state, stage).into_iter().next() {
            return Err(StageError::MissingInput { stage, field });
        }

        let prompt = match stage {
            StageName::Planner => planner::prompt(&self.prompts, state),
            StageName::Researcher => researcher::prompt(&self.prompts, state),
            StageName::Executor => executor::prompt(&self.prompts, state),
            StageName::Validator => validator::prompt(&self.prompts, state, self.max_retries),
        }
        .map_err(|err| StageError::Prompt {
            stage,
            message: format!("{err:#}"),
        })?;

        Ok(GenerationRequest {
            label: stage.as_str().to_string(),
            prompt,
            temperature: self.temperatures.for_stage(stage),
            expect_json: stage == StageName::Planner,
        })
    }

    /// Turn generated text into the partial update `stage` owns.
    pub fn interpret(&self, stage: StageName, state: &SharedState, text: String) -> StateDelta {
        match stage {
            StageName::Planner => planner::interpret(state, &text),
            StageName::Researcher => researcher::interpret(text),
            StageName::Executor => executor::interpret(text),
            StageName::Validator => validator::interpret(state, text),
        }
    }
}
