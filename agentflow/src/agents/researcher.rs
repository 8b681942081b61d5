//! Researcher: gathers context for the current plan.

use crate::core::state::SharedState;
use crate::core::state_update::StateDelta;
use crate::io::prompt::PromptBuilder;

pub(crate) fn prompt(
    prompts: &PromptBuilder,
    state: &SharedState,
) -> Result<String, minijinja::Error> {
    prompts.researcher(state.goal(), state.plan())
}

pub(crate) fn interpret(text: String) -> StateDelta {
    StateDelta::Researcher {
        research_notes: text,
    }
}
