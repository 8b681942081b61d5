//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between stages, the orchestrator and
//! the execution log. They must not depend on external state or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Hard cap on Validator -> Planner cycles.
pub const MAX_RETRIES: u32 = 3;

/// The closed set of agent stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Planner,
    Researcher,
    Executor,
    Validator,
}

impl StageName {
    /// Stages in the order a single cycle runs them.
    pub const ALL: [StageName; 4] = [
        StageName::Planner,
        StageName::Researcher,
        StageName::Executor,
        StageName::Validator,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Planner => "planner",
            StageName::Researcher => "researcher",
            StageName::Executor => "executor",
            StageName::Validator => "validator",
        }
    }

    /// Fields this stage is allowed to write.
    pub fn owned_fields(self) -> &'static [StateField] {
        match self {
            StageName::Planner => &[StateField::Plan, StateField::CurrentStep],
            StageName::Researcher => &[StateField::ResearchNotes],
            StageName::Executor => &[StateField::DraftOutput],
            StageName::Validator => &[StateField::ValidationFeedback, StateField::RetryCount],
        }
    }

    /// Orchestrator phase in which this stage runs.
    pub fn phase(self) -> Phase {
        match self {
            StageName::Planner => Phase::Planning,
            StageName::Researcher => Phase::Researching,
            StageName::Executor => Phase::Executing,
            StageName::Validator => Phase::Validating,
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named fields of the shared state, used as execution log keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateField {
    Goal,
    Plan,
    ResearchNotes,
    DraftOutput,
    ValidationFeedback,
    RetryCount,
    CurrentStep,
}

impl StateField {
    pub fn as_str(self) -> &'static str {
        match self {
            StateField::Goal => "goal",
            StateField::Plan => "plan",
            StateField::ResearchNotes => "research_notes",
            StateField::DraftOutput => "draft_output",
            StateField::ValidationFeedback => "validation_feedback",
            StateField::RetryCount => "retry_count",
            StateField::CurrentStep => "current_step",
        }
    }
}

impl fmt::Display for StateField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of the Validator's generated text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Approval,
    Feedback,
}

/// Validator output: the raw text plus its classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFeedback {
    pub verdict: Verdict,
    pub text: String,
}

impl ValidationFeedback {
    pub fn is_approval(&self) -> bool {
        self.verdict == Verdict::Approval
    }
}

/// Orchestrator state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Planning,
    Researching,
    Executing,
    Validating,
    Terminated,
}

impl Phase {
    /// Stage executed in this phase; `None` once terminated.
    pub fn stage(self) -> Option<StageName> {
        match self {
            Phase::Planning => Some(StageName::Planner),
            Phase::Researching => Some(StageName::Researcher),
            Phase::Executing => Some(StageName::Executor),
            Phase::Validating => Some(StageName::Validator),
            Phase::Terminated => None,
        }
    }
}

/// Why a run stopped.
///
/// Approval and retry exhaustion are normal completions; the other variants
/// mean the final state is not a valid result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Termination {
    Approved,
    MaxRetriesExhausted {
        retry_count: u32,
    },
    StageFailure {
        stage: StageName,
        message: String,
    },
    Cancelled {
        /// Last stage that completed before the checkpoint, if any.
        after: Option<StageName>,
    },
}

impl Termination {
    /// Stable reason string recorded for the run.
    pub fn reason(&self) -> &'static str {
        match self {
            Termination::Approved => "approved",
            Termination::MaxRetriesExhausted { .. } => "max_retries_exhausted",
            Termination::StageFailure { .. } => "stage_failure",
            Termination::Cancelled { .. } => "cancelled",
        }
    }

    /// True when the run reached a terminal state through the normal loop.
    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            Termination::Approved | Termination::MaxRetriesExhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_phases_follow_cycle_order() {
        let phases: Vec<Phase> = StageName::ALL.iter().map(|s| s.phase()).collect();
        assert_eq!(
            phases,
            vec![
                Phase::Planning,
                Phase::Researching,
                Phase::Executing,
                Phase::Validating
            ]
        );
        for stage in StageName::ALL {
            assert_eq!(stage.phase().stage(), Some(stage));
        }
        assert_eq!(Phase::Terminated.stage(), None);
    }

    #[test]
    fn termination_serializes_with_reason_tag() {
        let json = serde_json::to_value(Termination::StageFailure {
            stage: StageName::Researcher,
            message: "boom".to_string(),
        })
        .expect("serialize");
        assert_eq!(json["reason"], "stage_failure");
        assert_eq!(json["stage"], "researcher");

        let json = serde_json::to_value(Termination::Approved).expect("serialize");
        assert_eq!(json, serde_json::json!({ "reason": "approved" }));
    }

    #[test]
    fn only_loop_endings_count_as_completion() {
        assert!(Termination::Approved.is_completion());
        assert!(Termination::MaxRetriesExhausted { retry_count: 3 }.is_completion());
        assert!(!Termination::Cancelled { after: None }.is_completion());
        assert!(
            !Termination::StageFailure {
                stage: StageName::Executor,
                message: String::new(),
            }
            .is_completion()
        );
    }
}
