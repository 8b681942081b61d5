//! Registry of asynchronously started runs.
//!
//! Each run owns its state and log; the registry only keeps the receiving
//! end of the run's snapshot channel plus its cancel flag. Nothing here is a
//! process-wide singleton: callers construct a registry and share it by
//! cloning.
//!
//! In-flight runs are always tracked. Terminated runs are kept up to
//! `FlowConfig::run_history`, oldest evicted first.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinError;
use tracing::{debug, error, info, instrument, warn};

use crate::core::state::{SharedState, StateError};
use crate::core::types::{Phase, StageName, Termination};
use crate::io::config::FlowConfig;
use crate::io::generator::{BackendError, Generator, build_generator};
use crate::io::run_archive::RunArchive;
use crate::orchestrator::{
    CancelFlag, Orchestrator, RunContext, RunEvent, RunSnapshot, new_run_id,
};

const EVENT_CAPACITY: usize = 256;

/// Why a run could not be started. No run exists when this is returned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StartError {
    #[error(transparent)]
    InvalidGoal(#[from] StateError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("generation backend unavailable: {0}")]
    Backend(#[from] BackendError),
}

/// Acknowledgement returned as soon as a run is spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAck {
    pub run_id: String,
    pub goal: String,
}

/// Where runs get their generator from.
#[derive(Clone)]
pub enum GeneratorSource {
    /// Build from `FlowConfig::generator` at every run start.
    Configured,
    /// Use this generator for every run.
    Fixed(Arc<dyn Generator>),
}

#[derive(Debug, Clone)]
struct RunHandle {
    snapshots: watch::Receiver<RunSnapshot>,
    cancel: CancelFlag,
}

impl RunHandle {
    fn is_terminated(&self) -> bool {
        self.snapshots.borrow().is_terminated()
    }
}

/// Tracked runs in start order.
#[derive(Debug, Default)]
struct RunTable {
    handles: HashMap<String, RunHandle>,
    order: VecDeque<String>,
}

impl RunTable {
    fn insert(&mut self, run_id: String, handle: RunHandle) {
        self.order.push_back(run_id.clone());
        self.handles.insert(run_id, handle);
    }

    /// Drop the oldest terminated runs beyond `keep`. In-flight runs stay.
    fn evict_terminated(&mut self, keep: usize) -> Vec<String> {
        let terminated: Vec<&String> = self
            .order
            .iter()
            .filter(|id| self.handles.get(*id).is_some_and(RunHandle::is_terminated))
            .collect();
        let excess = terminated.len().saturating_sub(keep);
        let evicted: Vec<String> = terminated.into_iter().take(excess).cloned().collect();
        for run_id in &evicted {
            self.handles.remove(run_id);
        }
        self.order.retain(|id| self.handles.contains_key(id));
        evicted
    }
}

struct Inner {
    config: FlowConfig,
    source: GeneratorSource,
    archive: Option<RunArchive>,
    runs: RwLock<RunTable>,
    latest: RwLock<Option<String>>,
    events: broadcast::Sender<RunEvent>,
}

#[derive(Clone)]
pub struct RunRegistry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RunRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRegistry")
            .field("config", &self.inner.config)
            .field("archive", &self.inner.archive)
            .finish_non_exhaustive()
    }
}

impl RunRegistry {
    pub fn new(config: FlowConfig, source: GeneratorSource) -> Self {
        Self::build(config, source, None)
    }

    /// Registry that archives every finished run under `archive`.
    pub fn with_archive(config: FlowConfig, source: GeneratorSource, archive: RunArchive) -> Self {
        Self::build(config, source, Some(archive))
    }

    fn build(config: FlowConfig, source: GeneratorSource, archive: Option<RunArchive>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                archive,
                runs: RwLock::new(RunTable::default()),
                latest: RwLock::new(None),
                events,
            }),
        }
    }

    pub fn config(&self) -> &FlowConfig {
        &self.inner.config
    }

    /// Validate inputs, build the generator and spawn the run.
    ///
    /// The run is supervised: if its task dies without terminating, a
    /// `stage_failure` snapshot is published in its place.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip_all)]
    pub fn start(&self, goal: &str) -> Result<RunAck, StartError> {
        let state = SharedState::new(goal)?;
        self.inner
            .config
            .validate()
            .map_err(|err| StartError::Config(format!("{err:#}")))?;
        let generator = match &self.inner.source {
            GeneratorSource::Configured => build_generator(&self.inner.config.generator)?,
            GeneratorSource::Fixed(generator) => Arc::clone(generator),
        };
        let orchestrator = Orchestrator::from_config(&self.inner.config, generator);

        let run_id = new_run_id();
        let cancel = CancelFlag::new();
        let (tx, rx) = watch::channel(RunSnapshot::pending(&run_id, state.clone()));
        let ctx = RunContext::new(run_id.clone())
            .with_cancel(cancel.clone())
            .with_snapshots(tx.clone())
            .with_events(self.inner.events.clone());

        {
            let mut runs = self.inner.runs.write().unwrap_or_else(PoisonError::into_inner);
            runs.insert(
                run_id.clone(),
                RunHandle {
                    snapshots: rx,
                    cancel,
                },
            );
            let evicted = runs.evict_terminated(self.inner.config.run_history);
            if !evicted.is_empty() {
                debug!(?evicted, "evicted terminated runs from history");
            }
        }
        *self
            .inner
            .latest
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(run_id.clone());

        let ack = RunAck {
            run_id: run_id.clone(),
            goal: state.goal().to_string(),
        };
        let archive = self.inner.archive.clone();
        let events = self.inner.events.clone();
        let run = tokio::spawn(async move { orchestrator.run_with(state, ctx).await });
        tokio::spawn(async move {
            match run.await {
                Ok(outcome) => {
                    if let Some(archive) = archive
                        && let Err(err) = archive.write(&outcome)
                    {
                        warn!(run_id = %outcome.run_id, error = %format!("{err:#}"), "failed to archive run");
                    }
                }
                Err(err) => record_aborted_run(&tx, &events, &err),
            }
        });
        info!(run_id = %ack.run_id, "run started");
        Ok(ack)
    }

    /// Latest published snapshot of `run_id`.
    pub fn snapshot(&self, run_id: &str) -> Option<RunSnapshot> {
        self.handle(run_id)
            .map(|handle| handle.snapshots.borrow().clone())
    }

    /// Snapshot of the most recently started run.
    pub fn latest(&self) -> Option<RunSnapshot> {
        let run_id = self
            .inner
            .latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        self.snapshot(&run_id)
    }

    /// Request cooperative cancellation. Returns false for unknown runs.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.handle(run_id) {
            Some(handle) => {
                handle.cancel.cancel();
                info!(run_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Wait until `run_id` terminates and return its final snapshot.
    pub async fn wait(&self, run_id: &str) -> Option<RunSnapshot> {
        let mut rx = self.handle(run_id)?.snapshots;
        // The sender lives until the final snapshot is published, so an error
        // here still leaves the last value readable.
        if let Ok(snapshot) = rx.wait_for(RunSnapshot::is_terminated).await {
            return Some(snapshot.clone());
        }
        let snapshot = rx.borrow().clone();
        Some(snapshot)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    /// Ids of tracked runs in start order.
    pub fn run_ids(&self) -> Vec<String> {
        self.inner
            .runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .iter()
            .cloned()
            .collect()
    }

    fn handle(&self, run_id: &str) -> Option<RunHandle> {
        self.inner
            .runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handles
            .get(run_id)
            .cloned()
    }
}

/// Publish a terminal snapshot for a run whose task ended without one.
fn record_aborted_run(
    snapshots: &watch::Sender<RunSnapshot>,
    events: &broadcast::Sender<RunEvent>,
    err: &JoinError,
) {
    let mut terminal = snapshots.borrow().clone();
    if terminal.is_terminated() {
        return;
    }
    let stage = terminal.phase.stage().unwrap_or(StageName::Planner);
    let termination = Termination::StageFailure {
        stage,
        message: format!("run task aborted: {err}"),
    };
    error!(run_id = %terminal.run_id, stage = %stage, error = %err, "run task aborted");
    terminal.phase = Phase::Terminated;
    terminal.termination = Some(termination.clone());
    terminal.updated_at = Utc::now();
    let run_id = terminal.run_id.clone();
    snapshots.send_replace(terminal);
    // No subscribers is fine.
    let _ = events.send(RunEvent::RunTerminated {
        run_id,
        termination,
    });
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::io::config::{GeneratorBackend, GeneratorConfig};
    use crate::io::generator::{GenerationError, GenerationRequest};
    use crate::test_support::ScriptedGenerator;

    #[derive(Debug)]
    struct PanickingGenerator;

    #[async_trait]
    impl Generator for PanickingGenerator {
        async fn generate(&self, _request: &GenerationRequest) -> Result<String, GenerationError> {
            panic!("generator exploded");
        }
    }

    fn approving() -> ScriptedGenerator {
        ScriptedGenerator::new()
            .always("planner", r#"["a", "b", "c"]"#)
            .always("researcher", "notes")
            .always("executor", "draft")
            .always("validator", "APPROVED")
    }

    #[tokio::test]
    async fn start_returns_ack_and_run_completes() {
        let registry = RunRegistry::new(
            FlowConfig::default(),
            GeneratorSource::Fixed(Arc::new(approving())),
        );
        let ack = registry.start("  Plan a launch ").expect("start");
        assert_eq!(ack.goal, "Plan a launch");

        let snapshot = registry.wait(&ack.run_id).await.expect("known run");
        assert_eq!(snapshot.termination, Some(Termination::Approved));
        assert_eq!(snapshot.log.len(), 4);
        assert_eq!(
            registry.latest().map(|s| s.run_id),
            Some(ack.run_id.clone())
        );
    }

    #[tokio::test]
    async fn empty_goal_is_rejected_without_a_run() {
        let registry = RunRegistry::new(
            FlowConfig::default(),
            GeneratorSource::Fixed(Arc::new(approving())),
        );
        assert_eq!(
            registry.start("   ").unwrap_err(),
            StartError::InvalidGoal(StateError::EmptyGoal)
        );
        assert!(registry.latest().is_none());
        assert!(registry.run_ids().is_empty());
    }

    #[tokio::test]
    async fn missing_backend_is_a_start_error() {
        let config = FlowConfig {
            generator: GeneratorConfig {
                backend: GeneratorBackend::Command,
                command: Vec::new(),
                ..GeneratorConfig::default()
            },
            ..FlowConfig::default()
        };
        let registry = RunRegistry::new(config, GeneratorSource::Configured);
        assert_eq!(
            registry.start("goal").unwrap_err(),
            StartError::Backend(BackendError::MissingCommand)
        );
    }

    #[tokio::test]
    async fn unknown_runs_are_reported() {
        let registry = RunRegistry::new(FlowConfig::default(), GeneratorSource::Configured);
        assert!(registry.snapshot("nope").is_none());
        assert!(!registry.cancel("nope"));
        assert!(registry.wait("nope").await.is_none());
    }

    #[tokio::test]
    async fn finished_runs_are_archived() {
        let temp = tempfile::tempdir().expect("tempdir");
        let archive = RunArchive::new(temp.path());
        let registry = RunRegistry::with_archive(
            FlowConfig::default(),
            GeneratorSource::Fixed(Arc::new(approving())),
            archive.clone(),
        );
        let ack = registry.start("goal").expect("start");
        registry.wait(&ack.run_id).await.expect("known run");

        // The archive is written right after the final snapshot.
        let mut outcome = archive.load_outcome(&ack.run_id);
        for _ in 0..50 {
            if outcome.is_ok() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            outcome = archive.load_outcome(&ack.run_id);
        }
        assert_eq!(outcome.expect("archived").termination, Termination::Approved);
    }

    #[tokio::test]
    async fn panicking_run_still_terminates() {
        let registry = RunRegistry::new(
            FlowConfig::default(),
            GeneratorSource::Fixed(Arc::new(PanickingGenerator)),
        );
        let ack = registry.start("goal").expect("start");

        let snapshot = registry.wait(&ack.run_id).await.expect("known run");
        assert_eq!(snapshot.phase, Phase::Terminated);
        let Some(Termination::StageFailure { stage, message }) = snapshot.termination else {
            panic!("stage failure expected, got {:?}", snapshot.termination);
        };
        assert_eq!(stage, StageName::Planner);
        assert!(message.starts_with("run task aborted"), "{message}");
        assert!(snapshot.log.is_empty());
    }

    #[tokio::test]
    async fn aborted_run_emits_terminated_event() {
        let registry = RunRegistry::new(
            FlowConfig::default(),
            GeneratorSource::Fixed(Arc::new(PanickingGenerator)),
        );
        let mut events = registry.subscribe();
        let ack = registry.start("goal").expect("start");
        registry.wait(&ack.run_id).await.expect("known run");

        let event = events.recv().await.expect("event");
        let RunEvent::RunTerminated { run_id, termination } = event else {
            panic!("run_terminated expected, got {event:?}");
        };
        assert_eq!(run_id, ack.run_id);
        assert!(matches!(termination, Termination::StageFailure { .. }));
    }

    #[tokio::test]
    async fn history_cap_evicts_oldest_terminated_runs() {
        let config = FlowConfig {
            run_history: 2,
            ..FlowConfig::default()
        };
        let registry = RunRegistry::new(config, GeneratorSource::Fixed(Arc::new(approving())));

        let mut ids = Vec::new();
        for _ in 0..4 {
            let ack = registry.start("goal").expect("start");
            registry.wait(&ack.run_id).await.expect("known run");
            ids.push(ack.run_id);
        }

        // Evicted at the fourth start: three terminated runs exceeded the cap.
        assert!(registry.snapshot(&ids[0]).is_none());
        assert_eq!(registry.run_ids(), ids[1..].to_vec());
        assert_eq!(registry.latest().map(|s| s.run_id), Some(ids[3].clone()));

        registry.start("goal").expect("start");
        assert!(registry.snapshot(&ids[1]).is_none());
        assert!(registry.snapshot(&ids[3]).is_some());
    }

    #[tokio::test]
    async fn in_flight_runs_are_never_evicted() {
        let config = FlowConfig {
            run_history: 1,
            ..FlowConfig::default()
        };
        let slow = approving().with_delay("planner", std::time::Duration::from_secs(5));
        let registry = RunRegistry::new(config, GeneratorSource::Fixed(Arc::new(slow)));

        let first = registry.start("goal").expect("start");
        let second = registry.start("goal").expect("start");
        let third = registry.start("goal").expect("start");
        assert_eq!(
            registry.run_ids(),
            vec![first.run_id.clone(), second.run_id, third.run_id]
        );
        registry.cancel(&first.run_id);
    }
}
