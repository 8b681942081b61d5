//! Planner: breaks the goal into 3-5 ordered steps.

use crate::core::plan::plan_or_stub;
use crate::core::state::SharedState;
use crate::core::state_update::StateDelta;
use crate::io::prompt::PromptBuilder;

pub(crate) fn prompt(
    prompts: &PromptBuilder,
    state: &SharedState,
) -> Result<String, minijinja::Error> {
    prompts.planner(state.goal())
}

/// Parse failures fall back to the stub plan; the step cursor is reset.
pub(crate) fn interpret(state: &SharedState, text: &str) -> StateDelta {
    StateDelta::Planner {
        plan: plan_or_stub(state.goal(), text),
        current_step: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_json_becomes_the_plan() {
        let state = SharedState::new("Launch a loyalty program").expect("state");
        let delta = interpret(
            &state,
            "```json\n[\"Define tiers\", \"Pick rewards\", \"Announce\"]\n```",
        );
        assert_eq!(
            delta,
            StateDelta::Planner {
                plan: vec![
                    "Define tiers".to_string(),
                    "Pick rewards".to_string(),
                    "Announce".to_string()
                ],
                current_step: 0,
            }
        );
    }

    #[test]
    fn prose_falls_back_to_stub() {
        let state = SharedState::new("Launch a loyalty program").expect("state");
        let StateDelta::Planner { plan, .. } = interpret(&state, "Sure! Here is my plan...") else {
            panic!("planner delta expected");
        };
        assert_eq!(
            plan,
            vec!["Explore Launch a loyalty program", "Execute", "Validate"]
        );
    }
}
