//! Flow configuration stored in `agentflow.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::execution_log::DEFAULT_DISPLAY_CHARS;
use crate::core::types::{MAX_RETRIES, StageName};

/// Default config file name, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "agentflow.toml";

/// Upper bound for every `*_timeout_secs` setting (one week).
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Flow configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values the orchestration contract specifies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlowConfig {
    /// Hard cap on Validator -> Planner cycles.
    pub max_retries: u32,

    /// Display length (characters) for long text fields in the execution log.
    pub log_truncate_chars: usize,

    /// Upper bound on a single stage's generation call, in seconds.
    pub stage_timeout_secs: u64,

    /// Optional wall-clock budget for a whole run, in seconds.
    pub run_timeout_secs: Option<u64>,

    /// Long prompt inputs (research notes, drafts) are cut to fit this budget.
    pub prompt_budget_bytes: usize,

    /// Terminated runs a server keeps in memory; older ones are evicted
    /// (and remain readable from the run archive, if enabled).
    pub run_history: usize,

    pub generator: GeneratorConfig,

    pub stages: StageTemperatures,

    pub capabilities: CapabilityConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorBackend {
    Gemini,
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneratorConfig {
    pub backend: GeneratorBackend,

    /// Model name for the Gemini backend.
    pub model: String,

    /// Environment variable holding the Gemini API key.
    pub api_key_env: String,

    /// Gemini API base URL (overridable for proxies and tests).
    pub base_url: String,

    /// HTTP request timeout for the Gemini backend, in seconds.
    pub request_timeout_secs: u64,

    /// Command for the command backend (e.g. `["ollama", "run", "llama3"]`).
    /// The prompt is written to stdin; stdout is the generated text.
    pub command: Vec<String>,

    /// Truncate command stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

/// Sampling temperature per stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StageTemperatures {
    pub planner: f32,
    pub researcher: f32,
    pub executor: f32,
    pub validator: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct CapabilityConfig {
    /// Base URL of the Capability Provider (e.g. `http://127.0.0.1:8001`).
    pub base_url: Option<String>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            log_truncate_chars: DEFAULT_DISPLAY_CHARS,
            stage_timeout_secs: 120,
            run_timeout_secs: None,
            prompt_budget_bytes: 40_000,
            run_history: 100,
            generator: GeneratorConfig::default(),
            stages: StageTemperatures::default(),
            capabilities: CapabilityConfig::default(),
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            backend: GeneratorBackend::Gemini,
            model: "gemini-2.0-flash".to_string(),
            api_key_env: "GOOGLE_API_KEY".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            request_timeout_secs: 90,
            command: Vec::new(),
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for StageTemperatures {
    fn default() -> Self {
        Self {
            planner: 0.0,
            researcher: 0.0,
            executor: 0.7,
            validator: 0.0,
        }
    }
}

impl StageTemperatures {
    pub fn for_stage(&self, stage: StageName) -> f32 {
        match stage {
            StageName::Planner => self.planner,
            StageName::Researcher => self.researcher,
            StageName::Executor => self.executor,
            StageName::Validator => self.validator,
        }
    }
}

impl FlowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(anyhow!("max_retries must be > 0"));
        }
        if self.log_truncate_chars == 0 {
            return Err(anyhow!("log_truncate_chars must be > 0"));
        }
        if self.stage_timeout_secs == 0 {
            return Err(anyhow!("stage_timeout_secs must be > 0"));
        }
        if self.stage_timeout_secs > MAX_TIMEOUT_SECS {
            return Err(anyhow!("stage_timeout_secs must be <= {MAX_TIMEOUT_SECS}"));
        }
        if self.run_timeout_secs == Some(0) {
            return Err(anyhow!("run_timeout_secs must be > 0 when set"));
        }
        if self
            .run_timeout_secs
            .is_some_and(|secs| secs > MAX_TIMEOUT_SECS)
        {
            return Err(anyhow!("run_timeout_secs must be <= {MAX_TIMEOUT_SECS}"));
        }
        if self.run_history == 0 {
            return Err(anyhow!("run_history must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.generator.output_limit_bytes == 0 {
            return Err(anyhow!("generator.output_limit_bytes must be > 0"));
        }
        if self.generator.request_timeout_secs == 0 {
            return Err(anyhow!("generator.request_timeout_secs must be > 0"));
        }
        if self.generator.request_timeout_secs > MAX_TIMEOUT_SECS {
            return Err(anyhow!(
                "generator.request_timeout_secs must be <= {MAX_TIMEOUT_SECS}"
            ));
        }
        if self.generator.model.trim().is_empty() {
            return Err(anyhow!("generator.model must not be empty"));
        }
        for stage in StageName::ALL {
            let temperature = self.stages.for_stage(stage);
            if !(0.0..=2.0).contains(&temperature) {
                return Err(anyhow!(
                    "stages.{stage} temperature must be within 0.0..=2.0"
                ));
            }
        }
        Ok(())
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `FlowConfig::default()`.
pub fn load_config(path: &Path) -> Result<FlowConfig> {
    if !path.exists() {
        let cfg = FlowConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: FlowConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &FlowConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, FlowConfig::default());
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.log_truncate_chars, 200);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("agentflow.toml");
        let cfg = FlowConfig {
            run_timeout_secs: Some(600),
            capabilities: CapabilityConfig {
                base_url: Some("http://127.0.0.1:8001".to_string()),
            },
            ..FlowConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("agentflow.toml");
        fs::write(
            &path,
            "max_retries = 5\n[generator]\nbackend = \"command\"\ncommand = [\"cat\"]\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.generator.backend, GeneratorBackend::Command);
        assert_eq!(cfg.generator.command, vec!["cat"]);
        assert_eq!(cfg.generator.model, "gemini-2.0-flash");
        assert_eq!(cfg.stages.for_stage(StageName::Executor), 0.7);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("agentflow.toml");
        fs::write(&path, "max_retries = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("max_retries must be > 0"));

        let cfg = FlowConfig {
            stages: StageTemperatures {
                executor: 3.5,
                ..StageTemperatures::default()
            },
            ..FlowConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn oversized_timeouts_are_rejected() {
        let cfg = FlowConfig {
            run_timeout_secs: Some(u64::MAX),
            ..FlowConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("run_timeout_secs must be <="));

        let cfg = FlowConfig {
            stage_timeout_secs: MAX_TIMEOUT_SECS + 1,
            ..FlowConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = FlowConfig {
            run_timeout_secs: Some(MAX_TIMEOUT_SECS),
            stage_timeout_secs: MAX_TIMEOUT_SECS,
            ..FlowConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn run_history_must_be_positive() {
        let cfg = FlowConfig {
            run_history: 0,
            ..FlowConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
