//! Local command backend: the prompt goes to stdin, stdout is the generated text.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::io::generator::{GenerationError, GenerationRequest, Generator};
use crate::io::process::run_command_with_timeout;

/// Hard ceiling for a single command invocation; the orchestrator's stage
/// timeout normally fires first.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct CommandGenerator {
    argv: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandGenerator {
    pub fn new(argv: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            argv,
            output_limit_bytes,
        }
    }
}

#[async_trait]
impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(label = %request.label, program = ?self.argv.first()))]
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(GenerationError::Command("empty command".to_string()));
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("AGENTFLOW_STAGE", &request.label)
            .env("AGENTFLOW_TEMPERATURE", request.temperature.to_string())
            .env(
                "AGENTFLOW_EXPECT_JSON",
                if request.expect_json { "1" } else { "0" },
            );

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            COMMAND_TIMEOUT,
            self.output_limit_bytes,
        )
        .await
        .map_err(|e| GenerationError::Command(format!("{e:#}")))?;

        if output.timed_out {
            return Err(GenerationError::Timeout(COMMAND_TIMEOUT));
        }
        if !output.success() {
            let code = output
                .status
                .and_then(|status| status.code())
                .map_or_else(|| "signal".to_string(), |code| code.to_string());
            let mut stderr = output.stderr_lossy();
            stderr.push_str(&output.stderr_truncated_notice("generator"));
            warn!(exit = %code, "generator command failed");
            return Err(GenerationError::Command(format!(
                "exit {code}: {}",
                stderr.trim()
            )));
        }
        if output.stdout_truncated > 0 {
            warn!(
                truncated = output.stdout_truncated,
                "generator output exceeded limit"
            );
        }

        let text = output.stdout_lossy().trim().to_string();
        if text.is_empty() {
            return Err(GenerationError::Empty("command wrote nothing".to_string()));
        }
        debug!(response_len = text.len(), "command generator finished");
        Ok(text)
    }
}
