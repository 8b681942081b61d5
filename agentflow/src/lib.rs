//! Multi-agent orchestration engine.
//!
//! A goal is turned into a validated artifact by four stages run in a
//! bounded loop: Planner, Researcher, Executor, Validator. The Validator
//! either approves the draft or sends the run back to the Planner, at most
//! [`core::types::MAX_RETRIES`] times.
//!
//! - **[`core`]**: Pure, deterministic logic (state, transitions, log, parsing).
//!   No I/O, fully testable in isolation.
//! - **[`agents`]**: The stage set: request building and output interpretation.
//! - **[`io`]**: Side-effecting collaborators (generation backends, config,
//!   prompts, capability provider, run archive).
//!
//! [`orchestrator`] drives one run; [`runs`] starts runs asynchronously and
//! exposes their snapshots; [`dispatch`] is the question-to-capability flow.

pub mod agents;
pub mod core;
pub mod dispatch;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod runs;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
