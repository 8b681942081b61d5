//! Validator: classifies the draft as approval or feedback.
//!
//! The Validator only derives the next `retry_count`; whether the run ends is
//! the orchestrator's decision.

use crate::core::classifier::classify_validation;
use crate::core::state::SharedState;
use crate::core::state_update::StateDelta;
use crate::core::types::{ValidationFeedback, Verdict};
use crate::io::prompt::PromptBuilder;

pub(crate) fn prompt(
    prompts: &PromptBuilder,
    state: &SharedState,
    max_retries: u32,
) -> Result<String, minijinja::Error> {
    prompts.validator(
        state.goal(),
        state.draft_output().unwrap_or_default(),
        state.retry_count(),
        max_retries,
    )
}

pub(crate) fn interpret(state: &SharedState, text: String) -> StateDelta {
    let verdict = classify_validation(&text);
    let retry_count = match verdict {
        Verdict::Approval => state.retry_count(),
        Verdict::Feedback => state.retry_count() + 1,
    };
    StateDelta::Validator {
        validation_feedback: ValidationFeedback { verdict, text },
        retry_count,
    }
}
