//! AgentFlow HTTP server: starts runs asynchronously and exposes their state,
//! logs and progress events.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agentflow::io::capability::{CapabilityProvider, HttpCapabilityProvider};
use agentflow::io::config::{DEFAULT_CONFIG_FILE, load_config};
use agentflow::io::run_archive::RunArchive;
use agentflow::runs::{GeneratorSource, RunRegistry};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::info;

use crate::state::AppState;

const CAPABILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "agentflow-ui")]
#[command(about = "HTTP surface for starting and observing agentflow runs")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "8000")]
    port: u16,

    /// Path to the TOML config file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Archive finished runs under this directory
    #[arg(long)]
    archive: Option<PathBuf>,

    /// Directory containing UI static files
    #[arg(long)]
    ui_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("agentflow_ui=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let config = load_config(&args.config)?;
    info!(config = %args.config.display(), "starting agentflow-ui");

    let capabilities: Option<Arc<dyn CapabilityProvider>> =
        match config.capabilities.base_url.as_deref() {
            Some(base_url) => {
                info!(base_url, "capability provider configured");
                Some(Arc::new(HttpCapabilityProvider::new(
                    base_url,
                    CAPABILITY_TIMEOUT,
                )?))
            }
            None => None,
        };

    let registry = match args.archive {
        Some(dir) => {
            let archive = RunArchive::new(dir);
            info!(archive = %archive.dir().display(), "archiving finished runs");
            RunRegistry::with_archive(config, GeneratorSource::Configured, archive)
        }
        None => RunRegistry::new(config, GeneratorSource::Configured),
    };
    let state = AppState::new(registry, capabilities);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = routes::router(state).layer(cors);

    if let Some(ui_dir) = args.ui_dir {
        if ui_dir.exists() {
            info!(ui_dir = %ui_dir.display(), "serving static UI files");
            app = app
                .fallback_service(ServeDir::new(ui_dir).append_index_html_on_directories(true));
        } else {
            info!(ui_dir = %ui_dir.display(), "UI directory not found, API-only mode");
        }
    }

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
