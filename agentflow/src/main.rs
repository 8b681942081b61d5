//! AgentFlow command line.
//!
//! Runs one goal through the Planner -> Researcher -> Executor -> Validator
//! loop and prints the outcome as JSON. The exit code reflects why the run
//! terminated (see `exit_codes`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agentflow::core::state::SharedState;
use agentflow::core::transition::workflow_mermaid;
use agentflow::dispatch::ToolDispatcher;
use agentflow::exit_codes;
use agentflow::io::capability::HttpCapabilityProvider;
use agentflow::io::config::{DEFAULT_CONFIG_FILE, FlowConfig, load_config, write_config};
use agentflow::io::generator::build_generator;
use agentflow::io::prompt::PromptBuilder;
use agentflow::io::run_archive::RunArchive;
use agentflow::logging;
use agentflow::orchestrator::{Orchestrator, RunContext};
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

const CAPABILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(
    name = "agentflow",
    version,
    about = "Multi-agent planner/researcher/executor/validator loop"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Run a goal to termination and print the outcome.
    Run {
        /// The high-level goal.
        #[arg(short, long)]
        goal: String,
        /// Archive the finished run under this directory.
        #[arg(long)]
        archive: Option<PathBuf>,
    },
    /// Print the workflow graph as a Mermaid flowchart.
    Graph,
    /// Answer a question through the Capability Provider.
    Ask {
        #[arg(short, long)]
        question: String,
    },
}

#[tokio::main]
async fn main() {
    logging::init("warn");
    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Run { goal, archive } => cmd_run(&cli.config, &goal, archive).await,
        Command::Graph => {
            print!("{}", workflow_mermaid());
            Ok(exit_codes::OK)
        }
        Command::Ask { question } => cmd_ask(&cli.config, &question).await,
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    write_config(config_path, &FlowConfig::default())
        .with_context(|| format!("write {}", config_path.display()))?;
    println!("wrote {}", config_path.display());
    Ok(exit_codes::OK)
}

async fn cmd_run(config_path: &Path, goal: &str, archive: Option<PathBuf>) -> Result<i32> {
    let config = load_config(config_path)?;
    let state = SharedState::new(goal)?;
    let generator = build_generator(&config.generator).context("start run")?;
    let orchestrator = Orchestrator::from_config(&config, generator);

    let ctx = RunContext::generate();
    info!(run_id = ctx.run_id(), "starting run");
    let cancel = ctx.cancel_flag().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling after the current stage");
            cancel.cancel();
        }
    });

    let outcome = orchestrator.run_with(state, ctx).await;
    if let Some(dir) = archive {
        let path = RunArchive::new(dir).write(&outcome)?;
        info!(path = %path.display(), "run archived");
    }
    print_json(&outcome)?;
    Ok(exit_codes::for_termination(&outcome.termination))
}

async fn cmd_ask(config_path: &Path, question: &str) -> Result<i32> {
    let config = load_config(config_path)?;
    let Some(base_url) = config.capabilities.base_url.as_deref() else {
        bail!(
            "capabilities.base_url is not set in {}",
            config_path.display()
        );
    };
    let provider = HttpCapabilityProvider::new(base_url, CAPABILITY_TIMEOUT)?;
    let generator = build_generator(&config.generator)?;
    let dispatcher = ToolDispatcher::new(
        Arc::new(provider),
        generator,
        PromptBuilder::new(config.prompt_budget_bytes),
    );
    let outcome = dispatcher.ask(question).await?;
    print_json(&outcome)?;
    Ok(exit_codes::OK)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{payload}");
    Ok(())
}
