//! Stable exit codes for agentflow CLI commands.

use crate::core::types::Termination;

/// Command succeeded, or the run ended with approval.
pub const OK: i32 = 0;
/// Invalid input, configuration or backend, or any other error before a run.
pub const INVALID: i32 = 1;
/// The run ended because the retry budget was exhausted.
pub const MAX_RETRIES: i32 = 2;
/// A stage failed and the run stopped.
pub const STAGE_FAILURE: i32 = 3;
/// The run was cancelled.
pub const CANCELLED: i32 = 4;

/// Exit code reported for a finished run.
pub fn for_termination(termination: &Termination) -> i32 {
    match termination {
        Termination::Approved => OK,
        Termination::MaxRetriesExhausted { .. } => MAX_RETRIES,
        Termination::StageFailure { .. } => STAGE_FAILURE,
        Termination::Cancelled { .. } => CANCELLED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StageName;

    #[test]
    fn each_reason_has_a_distinct_code() {
        let codes = [
            for_termination(&Termination::Approved),
            for_termination(&Termination::MaxRetriesExhausted { retry_count: 3 }),
            for_termination(&Termination::StageFailure {
                stage: StageName::Researcher,
                message: "boom".to_string(),
            }),
            for_termination(&Termination::Cancelled { after: None }),
        ];
        assert_eq!(codes, [OK, MAX_RETRIES, STAGE_FAILURE, CANCELLED]);
        assert!(!codes.contains(&INVALID));
    }
}
