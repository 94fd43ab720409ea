//! Flow run REST API endpoints
//!
//! Runs are only created here; the scheduler loop picks them up on its next pass.

use crate::{error::ConfigError, runtime::FlowProcessor, store::{FlowRun, TaskRun}};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Processor owning the flow pack and the store
    pub processor: FlowProcessor,
}

/// Request body for starting a run
#[derive(Debug, Default, Deserialize)]
pub struct StartRunRequest {
    /// Stored under `context.flow_params`
    #[serde(default)]
    pub params: Value,
    /// Do not schedule the run before this many seconds have passed
    #[serde(default)]
    pub delay_seconds: Option<u64>,
}

/// Run together with its task progress
#[derive(Debug, Serialize)]
pub struct RunDetails {
    pub run: FlowRun,
    pub task_runs: Vec<TaskRun>,
}

/// Create flow and run routes
pub fn create_flow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/flows", get(list_flows))
        .route("/api/flows/{name}/runs", post(start_run))
        .route("/api/runs/{uid}", get(get_run))
        .route("/api/processor", get(processor_status))
}

/// List registered flows
///
/// GET /api/flows
/// Returns: { "flows": [{ "name": "...", "tasks": [...] }] }
async fn list_flows(State(state): State<AppState>) -> Json<Value> {
    let pack = state.processor.pack();
    let flows: Vec<Value> = pack
        .flow_names()
        .into_iter()
        .filter_map(|name| pack.get_flow_by_name(&name).ok())
        .map(|graph| json!({ "name": graph.name(), "tasks": graph.task_names() }))
        .collect();
    Json(json!({ "flows": flows }))
}

/// Start a run of a registered flow
///
/// POST /api/flows/{name}/runs
/// Body: { "params": {...}, "delay_seconds": 30 }
async fn start_run(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<StartRunRequest>>,
) -> Result<(StatusCode, Json<FlowRun>), StatusCode> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let delay = request.delay_seconds.map(Duration::from_secs);

    match state.processor.run_flow_by_name(&name, request.params, delay).await {
        Ok(run) => Ok((StatusCode::CREATED, Json(run))),
        Err(e) if matches!(e.downcast_ref::<ConfigError>(), Some(ConfigError::FlowNotFound(_))) => {
            Err(StatusCode::NOT_FOUND)
        }
        Err(e) => {
            tracing::error!("Failed to start run of flow '{}': {:#}", name, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Get a run by uid with its task runs
///
/// GET /api/runs/{uid}
async fn get_run(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<Json<RunDetails>, StatusCode> {
    let store = state.processor.store();
    let run = match store.get_flow_run(&uid).await {
        Ok(Some(run)) => run,
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to load run {}: {:#}", uid, e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    match store.find_task_runs(&uid).await {
        Ok(task_runs) => Ok(Json(RunDetails { run, task_runs })),
        Err(e) => {
            tracing::error!("Failed to load task runs of {}: {:#}", uid, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Processor identity and load
///
/// GET /api/processor
async fn processor_status(State(state): State<AppState>) -> Json<Value> {
    let processor = &state.processor;
    Json(json!({
        "owner": processor.owner(),
        "flows": processor.pack().flow_names(),
        "in_flight": processor.in_flight(),
        "max_in_flight": processor.config().max_in_flight,
        "sibling_dispatch": processor.config().sibling_dispatch,
    }))
}
