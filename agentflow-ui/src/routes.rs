//! HTTP route handlers: run trigger, state/log queries, graph and tool dispatch.

use std::sync::Arc;

use agentflow::core::execution_log::LogEntry;
use agentflow::core::state::SharedState;
use agentflow::core::transition::workflow_mermaid;
use agentflow::core::types::{Phase, Termination};
use agentflow::dispatch::{DispatchError, DispatchOutcome, ToolDispatcher};
use agentflow::io::capability::CapabilityError;
use agentflow::io::generator::build_generator;
use agentflow::io::prompt::PromptBuilder;
use agentflow::orchestrator::RunSnapshot;
use agentflow::runs::{GeneratorSource, StartError};
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::sse;
use crate::state::AppState;

/// JSON error body with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(what: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("{what} not found"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StartError> for ApiError {
    fn from(err: StartError) -> Self {
        let status = match err {
            StartError::InvalidGoal(_) => StatusCode::BAD_REQUEST,
            StartError::Config(_) | StartError::Backend(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, err.to_string())
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        let status = match &err {
            DispatchError::EmptyQuestion => StatusCode::BAD_REQUEST,
            DispatchError::Refused(_) => StatusCode::FORBIDDEN,
            DispatchError::Capability(CapabilityError::NotFound(_)) => StatusCode::NOT_FOUND,
            DispatchError::Capability(_)
            | DispatchError::Generation(_)
            | DispatchError::Intent(_) => StatusCode::BAD_GATEWAY,
            DispatchError::Prompt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

/// Build the router with all routes and `state` applied.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/run", post(start_run))
        .route("/state", get(get_state))
        .route("/logs", get(get_logs))
        .route("/runs", get(list_runs))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .route("/graph", get(get_graph))
        .route("/ask", post(ask))
        .route("/events", get(sse::events_handler))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    #[serde(default)]
    goal: String,
}

#[derive(Debug, Serialize)]
struct RunStarted {
    status: &'static str,
    run_id: String,
    goal: String,
}

/// POST /run - start a run and acknowledge immediately.
async fn start_run(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<(StatusCode, Json<RunStarted>), ApiError> {
    let ack = state.registry.start(&request.goal).inspect_err(|err| {
        warn!(error = %err, "run start rejected");
    })?;
    info!(run_id = %ack.run_id, "run accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(RunStarted {
            status: "started",
            run_id: ack.run_id,
            goal: ack.goal,
        }),
    ))
}

#[derive(Debug, Serialize)]
struct StateView {
    run_id: String,
    phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    termination: Option<Termination>,
    state: SharedState,
}

/// GET /state - state of the most recent run.
async fn get_state(State(state): State<AppState>) -> Result<Json<StateView>, ApiError> {
    let snapshot = state
        .registry
        .latest()
        .ok_or_else(|| ApiError::not_found("run"))?;
    Ok(Json(StateView {
        run_id: snapshot.run_id,
        phase: snapshot.phase,
        termination: snapshot.termination,
        state: snapshot.state,
    }))
}

#[derive(Debug, Serialize)]
struct LogsView {
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<String>,
    logs: Vec<LogEntry>,
}

/// GET /logs - execution log of the most recent run (empty before any run).
async fn get_logs(State(state): State<AppState>) -> Json<LogsView> {
    let view = match state.registry.latest() {
        Some(snapshot) => LogsView {
            run_id: Some(snapshot.run_id),
            logs: snapshot.log,
        },
        None => LogsView {
            run_id: None,
            logs: Vec::new(),
        },
    };
    Json(view)
}

/// GET /runs - ids of tracked runs, oldest first.
async fn list_runs(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "runs": state.registry.run_ids() }))
}

/// GET /runs/{run_id} - full snapshot of one run.
async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunSnapshot>, ApiError> {
    state
        .registry
        .snapshot(&run_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("run"))
}

/// POST /runs/{run_id}/cancel - request cancellation at the next stage boundary.
async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let snapshot = state
        .registry
        .snapshot(&run_id)
        .ok_or_else(|| ApiError::not_found("run"))?;
    if snapshot.is_terminated() {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("run {run_id} already terminated"),
        ));
    }
    state.registry.cancel(&run_id);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "cancelling", "run_id": run_id })),
    ))
}

/// GET /graph - workflow graph as Mermaid.
async fn get_graph() -> Json<serde_json::Value> {
    Json(json!({ "mermaid": workflow_mermaid() }))
}

#[derive(Debug, Deserialize)]
struct AskRequest {
    #[serde(default)]
    question: String,
}

/// POST /ask - answer a question through the Capability Provider.
async fn ask(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<DispatchOutcome>, ApiError> {
    let Some(provider) = state.capabilities.clone() else {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "no capability provider configured",
        ));
    };
    let config = state.registry.config();
    let generator = match &state.ask_generator {
        GeneratorSource::Configured => build_generator(&config.generator)
            .map_err(|err| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()))?,
        GeneratorSource::Fixed(generator) => Arc::clone(generator),
    };
    let dispatcher = ToolDispatcher::new(
        provider,
        generator,
        PromptBuilder::new(config.prompt_budget_bytes),
    );
    let outcome = dispatcher.ask(&request.question).await?;
    Ok(Json(outcome))
}
