//! Shared-state invariants not expressible in the type system.

use crate::core::state::SharedState;
use crate::core::types::{StageName, StateField};

/// Check a single merge step from `prev` to `next` made by `stage`:
/// - `goal` is unchanged
/// - `retry_count` never decreases and grows by at most one per Validator run
/// - fields outside the stage's ownership are unchanged
/// - the stage's inputs were produced earlier in the cycle ordering
pub fn check_merge(prev: &SharedState, next: &SharedState, stage: StageName) -> Vec<String> {
    let mut errors = Vec::new();

    if prev.goal() != next.goal() {
        errors.push("goal changed after run start".to_string());
    }

    if next.retry_count() < prev.retry_count() {
        errors.push(format!(
            "retry_count decreased from {} to {}",
            prev.retry_count(),
            next.retry_count()
        ));
    }
    if next.retry_count() > prev.retry_count() + 1 {
        errors.push(format!(
            "retry_count jumped from {} to {}",
            prev.retry_count(),
            next.retry_count()
        ));
    }

    let owned = stage.owned_fields();
    for field in changed_fields(prev, next) {
        if !owned.contains(&field) {
            errors.push(format!("{stage} wrote field '{field}' it does not own"));
        }
    }

    for field in missing_inputs(prev, stage) {
        errors.push(format!("{stage} ran before '{field}' was produced"));
    }

    errors
}

/// Check a terminal state against the retry budget.
pub fn check_final(state: &SharedState, max_retries: u32) -> Vec<String> {
    let mut errors = Vec::new();
    if state.retry_count() > max_retries {
        errors.push(format!(
            "retry_count {} exceeds max_retries {}",
            state.retry_count(),
            max_retries
        ));
    }
    if state.plan().is_empty() && state.research_notes().is_some() {
        errors.push("research notes exist without a plan".to_string());
    }
    errors
}

/// Inputs `stage` requires that are not yet present in `state`.
pub fn missing_inputs(state: &SharedState, stage: StageName) -> Vec<StateField> {
    let mut missing = Vec::new();
    match stage {
        StageName::Planner => {}
        StageName::Researcher => {
            if state.plan().is_empty() {
                missing.push(StateField::Plan);
            }
        }
        StageName::Executor => {
            if state.plan().is_empty() {
                missing.push(StateField::Plan);
            }
            if state.research_notes().is_none() {
                missing.push(StateField::ResearchNotes);
            }
        }
        StageName::Validator => {
            if state.draft_output().is_none() {
                missing.push(StateField::DraftOutput);
            }
        }
    }
    missing
}

fn changed_fields(prev: &SharedState, next: &SharedState) -> Vec<StateField> {
    let mut changed = Vec::new();
    if prev.plan() != next.plan() {
        changed.push(StateField::Plan);
    }
    if prev.current_step() != next.current_step() {
        changed.push(StateField::CurrentStep);
    }
    if prev.research_notes() != next.research_notes() {
        changed.push(StateField::ResearchNotes);
    }
    if prev.draft_output() != next.draft_output() {
        changed.push(StateField::DraftOutput);
    }
    if prev.validation_feedback() != next.validation_feedback() {
        changed.push(StateField::ValidationFeedback);
    }
    if prev.retry_count() != next.retry_count() {
        changed.push(StateField::RetryCount);
    }
    changed
}
