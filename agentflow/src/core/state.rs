//! The shared state threaded through every stage of one run.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{ValidationFeedback, Verdict};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("goal must not be empty")]
    EmptyGoal,
}

/// Per-run record updated by stage deltas.
///
/// Fields are only writable through [`SharedState::with_delta`], so `goal`
/// can never change after construction and each stage touches only its own
/// fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedState {
    goal: String,
    pub(crate) plan: Vec<String>,
    pub(crate) research_notes: Option<String>,
    pub(crate) draft_output: Option<String>,
    pub(crate) validation_feedback: Option<ValidationFeedback>,
    pub(crate) retry_count: u32,
    pub(crate) current_step: u32,
}

impl SharedState {
    /// Seed a fresh state for `goal`. The goal is trimmed and must be non-empty.
    pub fn new(goal: &str) -> Result<Self, StateError> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(StateError::EmptyGoal);
        }
        Ok(Self {
            goal: goal.to_string(),
            plan: Vec::new(),
            research_notes: None,
            draft_output: None,
            validation_feedback: None,
            retry_count: 0,
            current_step: 0,
        })
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn plan(&self) -> &[String] {
        &self.plan
    }

    pub fn research_notes(&self) -> Option<&str> {
        self.research_notes.as_deref()
    }

    pub fn draft_output(&self) -> Option<&str> {
        self.draft_output.as_deref()
    }

    pub fn validation_feedback(&self) -> Option<&ValidationFeedback> {
        self.validation_feedback.as_ref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn current_step(&self) -> u32 {
        self.current_step
    }

    /// Classification of the latest Validator output, if the Validator has run.
    pub fn verdict(&self) -> Option<Verdict> {
        self.validation_feedback.as_ref().map(|f| f.verdict)
    }
}
