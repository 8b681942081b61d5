//! Optional on-disk archive of finished runs.
//!
//! Layout: `<dir>/<run_id>/state.json`, `log.json`, `outcome.json`.
//! Each file is pretty JSON with a trailing newline, written atomically.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::core::execution_log::LogEntry;
use crate::core::state::SharedState;
use crate::io::write_atomic;
use crate::orchestrator::RunOutcome;

const STATE_FILE: &str = "state.json";
const LOG_FILE: &str = "log.json";
const OUTCOME_FILE: &str = "outcome.json";

#[derive(Debug, Clone)]
pub struct RunArchive {
    dir: PathBuf,
}

impl RunArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        validate_run_id(run_id)?;
        Ok(self.dir.join(run_id))
    }

    #[instrument(skip_all, fields(run_id = %outcome.run_id))]
    pub fn write(&self, outcome: &RunOutcome) -> Result<PathBuf> {
        let run_dir = self.run_dir(&outcome.run_id)?;
        write_json(&run_dir.join(STATE_FILE), &outcome.state)?;
        write_json(&run_dir.join(LOG_FILE), &outcome.log)?;
        write_json(&run_dir.join(OUTCOME_FILE), outcome)?;
        debug!(path = %run_dir.display(), "run archived");
        Ok(run_dir)
    }

    pub fn load_outcome(&self, run_id: &str) -> Result<RunOutcome> {
        read_json(&self.run_dir(run_id)?.join(OUTCOME_FILE))
    }

    pub fn load_state(&self, run_id: &str) -> Result<SharedState> {
        read_json(&self.run_dir(run_id)?.join(STATE_FILE))
    }

    pub fn load_log(&self, run_id: &str) -> Result<Vec<LogEntry>> {
        read_json(&self.run_dir(run_id)?.join(LOG_FILE))
    }
}

fn validate_run_id(run_id: &str) -> Result<()> {
    let valid = !run_id.is_empty()
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(anyhow!("invalid run id '{run_id}'"))
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}
