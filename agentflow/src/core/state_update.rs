//! Stage-owned state deltas and how they merge into [`SharedState`].

use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::core::state::SharedState;
use crate::core::types::{StageName, StateField, ValidationFeedback};

/// Partial update produced by one stage execution.
///
/// Each variant carries exactly the fields its stage owns, so a delta can
/// never write outside its stage's ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateDelta {
    Planner {
        plan: Vec<String>,
        current_step: u32,
    },
    Researcher {
        research_notes: String,
    },
    Executor {
        draft_output: String,
    },
    Validator {
        validation_feedback: ValidationFeedback,
        retry_count: u32,
    },
}

impl StateDelta {
    pub fn stage(&self) -> StageName {
        match self {
            StateDelta::Planner { .. } => StageName::Planner,
            StateDelta::Researcher { .. } => StageName::Researcher,
            StateDelta::Executor { .. } => StageName::Executor,
            StateDelta::Validator { .. } => StageName::Validator,
        }
    }

    /// Field -> new value, in field order.
    pub fn to_fields(&self) -> BTreeMap<StateField, Value> {
        let mut fields = BTreeMap::new();
        match self {
            StateDelta::Planner { plan, current_step } => {
                fields.insert(StateField::Plan, json!(plan));
                fields.insert(StateField::CurrentStep, json!(current_step));
            }
            StateDelta::Researcher { research_notes } => {
                fields.insert(StateField::ResearchNotes, json!(research_notes));
            }
            StateDelta::Executor { draft_output } => {
                fields.insert(StateField::DraftOutput, json!(draft_output));
            }
            StateDelta::Validator {
                validation_feedback,
                retry_count,
            } => {
                fields.insert(StateField::ValidationFeedback, json!(validation_feedback));
                fields.insert(StateField::RetryCount, json!(retry_count));
            }
        }
        fields
    }
}

impl SharedState {
    /// Return a new state with `delta` merged in.
    ///
    /// Only the fields carried by the delta change; everything else, `goal`
    /// included, is copied unchanged. The receiver is left untouched so callers
    /// can publish the result as a whole-state replacement.
    pub fn with_delta(&self, delta: &StateDelta) -> SharedState {
        let mut next = self.clone();
        match delta {
            StateDelta::Planner { plan, current_step } => {
                next.plan = plan.clone();
                next.current_step = *current_step;
            }
            StateDelta::Researcher { research_notes } => {
                next.research_notes = Some(research_notes.clone());
            }
            StateDelta::Executor { draft_output } => {
                next.draft_output = Some(draft_output.clone());
            }
            StateDelta::Validator {
                validation_feedback,
                retry_count,
            } => {
                next.validation_feedback = Some(validation_feedback.clone());
                next.retry_count = *retry_count;
            }
        }
        next
    }
}
