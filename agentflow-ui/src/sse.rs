//! Server-Sent Events stream of run progress.

use std::convert::Infallible;
use std::time::Duration;

use agentflow::orchestrator::RunEvent;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tokio::sync::broadcast;
use tracing::warn;

use crate::state::AppState;

fn event_name(event: &RunEvent) -> &'static str {
    match event {
        RunEvent::StageCompleted { .. } => "stage_completed",
        RunEvent::RunTerminated { .. } => "run_terminated",
    }
}

/// GET /events - one SSE event per completed stage and per terminated run.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.registry.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(run_event) => {
                    if let Ok(json) = serde_json::to_string(&run_event) {
                        yield Ok(Event::default().event(event_name(&run_event)).data(json));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

#[cfg(test)]
mod tests {
    use agentflow::core::types::{Phase, StageName, Termination};

    use super::*;

    #[test]
    fn event_names_follow_variants() {
        let completed = RunEvent::StageCompleted {
            run_id: "r".to_string(),
            seq: 1,
            stage: StageName::Planner,
            retry_count: 0,
            next_phase: Phase::Researching,
        };
        let terminated = RunEvent::RunTerminated {
            run_id: "r".to_string(),
            termination: Termination::Approved,
        };
        assert_eq!(event_name(&completed), "stage_completed");
        assert_eq!(event_name(&terminated), "run_terminated");
        let json = serde_json::to_value(&terminated).expect("json");
        assert_eq!(json["event"], "run_terminated");
        assert_eq!(json["termination"]["reason"], "approved");
    }
}
