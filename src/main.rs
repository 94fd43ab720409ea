//! Flowmill: persisted flow orchestration engine
//!
//! Demo host process. Registers a sample `etl` flow, then runs the scheduler and
//! the HTTP API until Ctrl-C.

use anyhow::Result;
use flowmill::{config::Config, server, FlowGraph, FlowPack, FnTask, TaskOutcome};
use serde_json::json;
use std::sync::Arc;

/// Application entry point
///
/// The server provides:
/// - Flow listing at /api/flows
/// - Run creation at POST /api/flows/{name}/runs
/// - Run inspection at /api/runs/{uid}
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<()> {
    server::init_tracing();

    // Load configuration (defaults to 0.0.0.0:3004 and data/flowmill.db)
    let config = Config::default();

    let pack = Arc::new(FlowPack::new());
    pack.add_flow(etl_flow()?)?;

    server::start_server(config, pack).await
}

/// extract -> transform -> load
///
/// `transform` waits a few seconds when asked to via `flow_params.hold_seconds`
/// and `load` stops the run when there is nothing to write.
fn etl_flow() -> Result<FlowGraph> {
    FlowGraph::build("etl", |flow| {
        let extract = flow.task(FnTask::new("extract", |ctx, run| {
            Box::pin(async move {
                let rows = ctx["flow_params"]["rows"].as_u64().unwrap_or(3);
                ctx["rows"] = json!((1..=rows).collect::<Vec<u64>>());
                tracing::info!("extracted {} rows for run {}", rows, run.uid);
                Ok::<_, anyhow::Error>(TaskOutcome::Success)
            })
        }))?;

        let transform = flow.task(FnTask::new("transform", |ctx, run| {
            Box::pin(async move {
                let hold = ctx["flow_params"]["hold_seconds"].as_u64().unwrap_or(0);
                if hold > 0 && run.delayed_until.is_none() {
                    return Ok(TaskOutcome::delay_secs(hold));
                }
                let doubled: Vec<u64> = ctx["rows"]
                    .as_array()
                    .map(|rows| rows.iter().filter_map(|v| v.as_u64()).map(|v| v * 2).collect())
                    .unwrap_or_default();
                ctx["rows"] = json!(doubled);
                Ok::<_, anyhow::Error>(TaskOutcome::Success)
            })
        }))?;

        let load = flow.task(FnTask::new("load", |ctx, _run| {
            Box::pin(async move {
                let count = ctx["rows"].as_array().map(Vec::len).unwrap_or(0);
                if count == 0 {
                    return Ok(TaskOutcome::stop("nothing to load"));
                }
                ctx["loaded"] = json!(count);
                Ok::<_, anyhow::Error>(TaskOutcome::Success)
            })
        }))?;

        flow.chain(&[&extract, &transform, &load])?;
        Ok(())
    })
}
