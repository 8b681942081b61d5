//! Time budget helpers for stage generation calls.

use std::time::{Duration, Instant};

/// Timeout for the next generation call: the per-stage timeout, capped by
/// whatever remains of the optional run deadline.
///
/// Returns `None` once the run deadline has passed.
pub fn stage_budget(stage_timeout: Duration, deadline: Option<Instant>) -> Option<Duration> {
    let Some(deadline) = deadline else {
        return Some(stage_timeout);
    };
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::ZERO);
    if remaining.is_zero() {
        return None;
    }
    Some(remaining.min(stage_timeout))
}
