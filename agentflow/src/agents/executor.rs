//! Executor: produces the draft from plan and research.

use crate::core::state::SharedState;
use crate::core::state_update::StateDelta;
use crate::io::prompt::PromptBuilder;

pub(crate) fn prompt(
    prompts: &PromptBuilder,
    state: &SharedState,
) -> Result<String, minijinja::Error> {
    prompts.executor(
        state.goal(),
        state.plan(),
        state.research_notes().unwrap_or_default(),
    )
}

pub(crate) fn interpret(text: String) -> StateDelta {
    StateDelta::Executor { draft_output: text }
}
