//! Deterministic, pure logic of the orchestration engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod classifier;
pub mod execution_log;
pub mod invariants;
pub mod plan;
pub mod state;
pub mod state_update;
pub mod transition;
pub mod types;
