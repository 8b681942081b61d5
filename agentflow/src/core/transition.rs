//! Orchestrator transition table and the workflow graph it describes.

use crate::core::state::SharedState;
use crate::core::types::{Phase, StageName, Termination, Verdict};

/// Outcome of evaluating the edge leaving a completed stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Run the next stage.
    Enter(StageName),
    /// Stop the run.
    Terminate(Termination),
}

/// Evaluate the transition after `completed` has been merged into `state`.
///
/// Must be called with the post-update state: the retry bound reads the
/// `retry_count` the Validator just wrote.
///
/// | From       | To         | Condition                                   |
/// |------------|------------|---------------------------------------------|
/// | planner    | researcher | always                                      |
/// | researcher | executor   | always                                      |
/// | executor   | validator  | always                                      |
/// | validator  | terminated | approval, or `retry_count >= max_retries`   |
/// | validator  | planner    | feedback and `retry_count < max_retries`    |
pub fn next_transition(completed: StageName, state: &SharedState, max_retries: u32) -> Transition {
    match completed {
        StageName::Planner => Transition::Enter(StageName::Researcher),
        StageName::Researcher => Transition::Enter(StageName::Executor),
        StageName::Executor => Transition::Enter(StageName::Validator),
        StageName::Validator => {
            if state.verdict() == Some(Verdict::Approval) {
                Transition::Terminate(Termination::Approved)
            } else if state.retry_count() >= max_retries {
                Transition::Terminate(Termination::MaxRetriesExhausted {
                    retry_count: state.retry_count(),
                })
            } else {
                Transition::Enter(StageName::Planner)
            }
        }
    }
}

/// Phase a run is in after `transition`.
pub fn phase_after(transition: &Transition) -> Phase {
    match transition {
        Transition::Enter(stage) => stage.phase(),
        Transition::Terminate(_) => Phase::Terminated,
    }
}

/// Render the stage graph as a Mermaid flowchart.
pub fn workflow_mermaid() -> String {
    let mut buf = String::from("graph TD;\n");
    buf.push_str("    __start__([<p>__start__</p>]):::first\n");
    for stage in StageName::ALL {
        buf.push_str(&format!("    {stage}({stage})\n"));
    }
    buf.push_str("    __end__([<p>__end__</p>]):::last\n");
    buf.push_str(&format!("    __start__ --> {};\n", StageName::Planner));
    for pair in StageName::ALL.windows(2) {
        buf.push_str(&format!("    {} --> {};\n", pair[0], pair[1]));
    }
    buf.push_str(&format!(
        "    {} -. &nbsp;retry&nbsp; .-> {};\n",
        StageName::Validator,
        StageName::Planner
    ));
    buf.push_str(&format!(
        "    {} -. &nbsp;end&nbsp; .-> __end__;\n",
        StageName::Validator
    ));
    buf.push_str("    classDef default fill:#f2f0ff,line-height:1.2\n");
    buf.push_str("    classDef first fill-opacity:0\n");
    buf.push_str("    classDef last fill:#bfb6fc\n");
    buf
}
