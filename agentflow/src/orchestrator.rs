//! The orchestration loop: Planner -> Researcher -> Executor -> Validator,
//! then either terminate or route back to the Planner.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::agents::{StageError, StageSet};
use crate::core::budget::stage_budget;
use crate::core::execution_log::{ExecutionLog, LogEntry};
use crate::core::invariants::{check_final, check_merge};
use crate::core::state::SharedState;
use crate::core::state_update::StateDelta;
use crate::core::transition::{Transition, next_transition, phase_after};
use crate::core::types::{MAX_RETRIES, Phase, StageName, Termination};
use crate::io::config::{FlowConfig, StageTemperatures};
use crate::io::generator::{GenerationError, Generator};
use crate::io::prompt::PromptBuilder;

/// Loop limits and display settings for one orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSettings {
    pub max_retries: u32,
    pub log_truncate_chars: usize,
    pub stage_timeout: Duration,
    pub run_timeout: Option<Duration>,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self::from_config(&FlowConfig::default())
    }
}

impl FlowSettings {
    pub fn from_config(config: &FlowConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            log_truncate_chars: config.log_truncate_chars,
            stage_timeout: config.stage_timeout(),
            run_timeout: config.run_timeout(),
        }
    }
}

/// Cooperative cancellation flag, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Immutable view of a run, replaced as a whole after every stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub phase: Phase,
    pub state: SharedState,
    pub log: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<Termination>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunSnapshot {
    /// Snapshot of a run that has not executed any stage yet.
    pub fn pending(run_id: &str, state: SharedState) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.to_string(),
            phase: Phase::Planning,
            state,
            log: Vec::new(),
            termination: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.termination.is_some()
    }
}

/// Progress notifications for live observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    StageCompleted {
        run_id: String,
        seq: u32,
        stage: StageName,
        retry_count: u32,
        next_phase: Phase,
    },
    RunTerminated {
        run_id: String,
        termination: Termination,
    },
}

/// Per-run context: identity, cancellation and publication channels.
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: String,
    cancel: CancelFlag,
    snapshots: Option<watch::Sender<RunSnapshot>>,
    events: Option<broadcast::Sender<RunEvent>>,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            cancel: CancelFlag::new(),
            snapshots: None,
            events: None,
        }
    }

    /// Context with a fresh random run id.
    pub fn generate() -> Self {
        Self::new(new_run_id())
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_snapshots(mut self, tx: watch::Sender<RunSnapshot>) -> Self {
        self.snapshots = Some(tx);
        self
    }

    pub fn with_events(mut self, tx: broadcast::Sender<RunEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    fn publish(&self, snapshot: RunSnapshot) {
        if let Some(tx) = &self.snapshots {
            tx.send_replace(snapshot);
        }
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            // No subscribers is fine.
            let _ = tx.send(event);
        }
    }
}

pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Final result of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub state: SharedState,
    pub log: Vec<LogEntry>,
    pub termination: Termination,
    pub validator_calls: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl RunOutcome {
    pub fn reason(&self) -> &'static str {
        self.termination.reason()
    }
}

/// Drives runs over a shared generator. Cheap to clone; holds no per-run state.
#[derive(Clone)]
pub struct Orchestrator {
    stages: Arc<StageSet>,
    generator: Arc<dyn Generator>,
    settings: FlowSettings,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(generator: Arc<dyn Generator>, stages: StageSet, settings: FlowSettings) -> Self {
        Self {
            stages: Arc::new(stages),
            generator,
            settings,
        }
    }

    pub fn from_config(config: &FlowConfig, generator: Arc<dyn Generator>) -> Self {
        let stages = StageSet::new(
            PromptBuilder::new(config.prompt_budget_bytes),
            config.stages.clone(),
            config.max_retries,
        );
        Self::new(generator, stages, FlowSettings::from_config(config))
    }

    /// Orchestrator with default settings around `generator`.
    pub fn with_generator(generator: Arc<dyn Generator>) -> Self {
        let settings = FlowSettings::default();
        let stages = StageSet::new(
            PromptBuilder::new(FlowConfig::default().prompt_budget_bytes),
            StageTemperatures::default(),
            MAX_RETRIES,
        );
        Self::new(generator, stages, settings)
    }

    /// Run `goal` to termination with a fresh context.
    pub async fn run(&self, goal: &str) -> Result<RunOutcome, crate::core::state::StateError> {
        let state = SharedState::new(goal)?;
        Ok(self.run_with(state, RunContext::generate()).await)
    }

    /// Run from `initial` to termination.
    ///
    /// Stages execute strictly in sequence. After every stage the merged
    /// state and log are published as one snapshot. Cancellation is only
    /// observed between stages.
    #[instrument(skip_all, fields(run_id = %ctx.run_id))]
    pub async fn run_with(&self, initial: SharedState, ctx: RunContext) -> RunOutcome {
        let started_at = Utc::now();
        // A budget too large to represent as an instant means no deadline.
        let deadline = self
            .settings
            .run_timeout
            .and_then(|budget| Instant::now().checked_add(budget));
        let mut state = initial;
        let mut log = ExecutionLog::new(self.settings.log_truncate_chars);
        let mut stage = StageName::Planner;
        let mut last_completed: Option<StageName> = None;
        let mut cycle = 1u32;
        let mut validator_calls = 0u32;

        info!(goal = %state.goal(), max_retries = self.settings.max_retries, "run started");
        ctx.publish(RunSnapshot {
            started_at,
            ..RunSnapshot::pending(&ctx.run_id, state.clone())
        });

        let termination = loop {
            if ctx.cancel.is_cancelled() {
                info!(after = ?last_completed, "run cancelled");
                break Termination::Cancelled {
                    after: last_completed,
                };
            }

            let delta = match self.invoke_stage(stage, &state, deadline).await {
                Ok(delta) => delta,
                Err(err) => {
                    error!(
                        stage = %stage,
                        transient = err.is_transient(),
                        error = %err,
                        "stage failed"
                    );
                    break Termination::StageFailure {
                        stage,
                        message: err.to_string(),
                    };
                }
            };

            state = match merge_stage(&state, stage, &delta) {
                Ok(merged) => merged,
                Err(message) => {
                    error!(stage = %stage, error = %message, "merge rejected");
                    break Termination::StageFailure { stage, message };
                }
            };
            if stage == StageName::Validator {
                validator_calls += 1;
            }
            let seq = log.append(&delta, cycle).seq;
            last_completed = Some(stage);

            let transition = next_transition(stage, &state, self.settings.max_retries);
            let next_phase = phase_after(&transition);
            debug!(
                stage = %stage,
                seq,
                cycle,
                retry_count = state.retry_count(),
                next_phase = ?next_phase,
                "stage merged"
            );
            ctx.publish(RunSnapshot {
                run_id: ctx.run_id.clone(),
                phase: next_phase,
                state: state.clone(),
                log: log.entries().to_vec(),
                termination: None,
                started_at,
                updated_at: Utc::now(),
            });
            ctx.emit(RunEvent::StageCompleted {
                run_id: ctx.run_id.clone(),
                seq,
                stage,
                retry_count: state.retry_count(),
                next_phase,
            });

            match transition {
                Transition::Enter(next) => {
                    if next == StageName::Planner {
                        cycle += 1;
                        info!(
                            retry_count = state.retry_count(),
                            "validator returned feedback, replanning"
                        );
                    }
                    stage = next;
                }
                Transition::Terminate(termination) => break termination,
            }
        };

        if termination.is_completion() {
            for violation in check_final(&state, self.settings.max_retries) {
                warn!(violation = %violation, "final state invariant violated");
            }
        }
        let ended_at = Utc::now();
        info!(
            reason = termination.reason(),
            retry_count = state.retry_count(),
            stages = log.len(),
            "run terminated"
        );

        let entries = log.into_entries();
        ctx.publish(RunSnapshot {
            run_id: ctx.run_id.clone(),
            phase: Phase::Terminated,
            state: state.clone(),
            log: entries.clone(),
            termination: Some(termination.clone()),
            started_at,
            updated_at: ended_at,
        });
        ctx.emit(RunEvent::RunTerminated {
            run_id: ctx.run_id.clone(),
            termination: termination.clone(),
        });

        RunOutcome {
            run_id: ctx.run_id,
            state,
            log: entries,
            termination,
            validator_calls,
            started_at,
            ended_at,
        }
    }

    /// Invoke one stage: build its request, await the generator once under
    /// the time budget, and interpret the text.
    async fn invoke_stage(
        &self,
        stage: StageName,
        state: &SharedState,
        deadline: Option<Instant>,
    ) -> Result<StateDelta, StageError> {
        let request = self.stages.request(stage, state)?;
        let budget = stage_budget(self.settings.stage_timeout, deadline)
            .ok_or(StageError::RunTimedOut { stage })?;

        debug!(stage = %stage, prompt_len = request.prompt.len(), "invoking stage");
        let text = match tokio::time::timeout(budget, self.generator.generate(&request)).await {
            Ok(result) => result.map_err(|source| StageError::Generation { stage, source })?,
            Err(_) => {
                return Err(StageError::Generation {
                    stage,
                    source: GenerationError::Timeout(budget),
                });
            }
        };
        Ok(self.stages.interpret(stage, state, text))
    }
}

/// Apply `delta` on behalf of `stage`, rejecting updates that break the
/// shared-state invariants.
fn merge_stage(
    state: &SharedState,
    stage: StageName,
    delta: &StateDelta,
) -> Result<SharedState, String> {
    let merged = state.with_delta(delta);
    let violations = check_merge(state, &merged, stage);
    if violations.is_empty() {
        Ok(merged)
    } else {
        Err(format!("invalid state update: {}", violations.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedGenerator;

    fn orchestrator(generator: ScriptedGenerator) -> Orchestrator {
        Orchestrator::with_generator(Arc::new(generator))
    }

    #[tokio::test]
    async fn approval_on_first_cycle_ends_run() {
        let generator = ScriptedGenerator::new()
            .always("planner", r#"["Research", "Draft", "Review"]"#)
            .always("researcher", "notes")
            .always("executor", "draft")
            .always("validator", "APPROVED. Ship it.");
        let outcome = orchestrator(generator).run("Write a haiku").await.expect("run");

        assert_eq!(outcome.termination, Termination::Approved);
        assert_eq!(outcome.state.retry_count(), 0);
        assert_eq!(outcome.validator_calls, 1);
        let stages: Vec<_> = outcome.log.iter().map(|e| e.stage).collect();
        assert_eq!(stages, StageName::ALL.to_vec());
    }

    #[tokio::test]
    async fn pre_cancelled_run_executes_nothing() {
        let generator = ScriptedGenerator::new();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let outcome = orchestrator(generator.clone())
            .run_with(
                SharedState::new("goal").expect("state"),
                RunContext::new("r1").with_cancel(cancel),
            )
            .await;
        assert_eq!(outcome.termination, Termination::Cancelled { after: None });
        assert!(outcome.log.is_empty());
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn slow_generation_times_out_as_stage_failure() {
        let generator = ScriptedGenerator::new()
            .always("planner", r#"["a"]"#)
            .with_delay("researcher", Duration::from_secs(5))
            .always("researcher", "late");
        let settings = FlowSettings {
            stage_timeout: Duration::from_millis(50),
            ..FlowSettings::default()
        };
        let orchestrator = Orchestrator::new(
            Arc::new(generator),
            StageSet::new(PromptBuilder::new(40_000), StageTemperatures::default(), 3),
            settings,
        );
        let outcome = orchestrator.run("goal").await.expect("run");
        let Termination::StageFailure { stage, message } = &outcome.termination else {
            panic!("stage failure expected, got {:?}", outcome.termination);
        };
        assert_eq!(*stage, StageName::Researcher);
        assert!(message.contains("timed out"));
        assert!(outcome.state.research_notes().is_none());
    }

    #[tokio::test]
    async fn snapshots_are_published_per_stage() {
        let generator = ScriptedGenerator::new()
            .always("planner", r#"["a"]"#)
            .always("researcher", "notes")
            .always("executor", "draft")
            .always("validator", "APPROVED");
        let initial = SharedState::new("goal").expect("state");
        let (tx, mut rx) = watch::channel(RunSnapshot::pending("r2", initial.clone()));
        let (events_tx, mut events_rx) = broadcast::channel(16);
        let ctx = RunContext::new("r2")
            .with_snapshots(tx)
            .with_events(events_tx);

        let outcome = orchestrator(generator).run_with(initial, ctx).await;
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.phase, Phase::Terminated);
        assert_eq!(snapshot.log, outcome.log);
        assert_eq!(snapshot.termination, Some(Termination::Approved));

        let mut completed = 0;
        while let Ok(event) = events_rx.try_recv() {
            match event {
                RunEvent::StageCompleted { .. } => completed += 1,
                RunEvent::RunTerminated { termination, .. } => {
                    assert_eq!(termination, Termination::Approved);
                }
            }
        }
        assert_eq!(completed, 4);
    }

    #[tokio::test]
    async fn unrepresentable_run_budget_means_no_deadline() {
        let generator = ScriptedGenerator::new()
            .always("planner", r#"["a"]"#)
            .always("researcher", "notes")
            .always("executor", "draft")
            .always("validator", "APPROVED");
        let settings = FlowSettings {
            run_timeout: Some(Duration::MAX),
            ..FlowSettings::default()
        };
        let orchestrator = Orchestrator::new(
            Arc::new(generator),
            StageSet::new(PromptBuilder::new(40_000), StageTemperatures::default(), 3),
            settings,
        );
        let outcome = orchestrator.run("goal").await.expect("run");
        assert_eq!(outcome.termination, Termination::Approved);
    }

    #[test]
    fn merge_accepts_owned_fields() {
        let state = SharedState::new("goal").expect("state");
        let merged = merge_stage(
            &state,
            StageName::Planner,
            &StateDelta::Planner {
                plan: vec!["a".to_string()],
                current_step: 0,
            },
        )
        .expect("planner owns plan");
        assert_eq!(merged.plan(), ["a".to_string()]);
    }

    #[test]
    fn merge_rejects_foreign_fields_and_missing_inputs() {
        let planned = SharedState::new("goal")
            .expect("state")
            .with_delta(&StateDelta::Planner {
                plan: vec!["a".to_string()],
                current_step: 0,
            });
        let err = merge_stage(
            &planned,
            StageName::Researcher,
            &StateDelta::Executor {
                draft_output: "draft".to_string(),
            },
        )
        .unwrap_err();
        assert!(err.starts_with("invalid state update: "));
        assert!(err.contains("researcher wrote field 'draft_output' it does not own"));

        let fresh = SharedState::new("goal").expect("state");
        let err = merge_stage(
            &fresh,
            StageName::Executor,
            &StateDelta::Executor {
                draft_output: "draft".to_string(),
            },
        )
        .unwrap_err();
        assert!(err.contains("executor ran before 'plan' was produced"));
    }
}
