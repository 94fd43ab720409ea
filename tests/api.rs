//! HTTP routes over an in-memory processor

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{etl, Harness};
use flowmill::{config::ProcessorConfig, server::create_app};
use serde_json::json;
use tower::ServiceExt;

fn start_run(flow: &str, body: &str) -> anyhow::Result<Request<Body>> {
    Ok(Request::builder()
        .method("POST")
        .uri(format!("/api/flows/{flow}/runs"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))?)
}

#[tokio::test]
async fn start_run_creates_active_run() -> anyhow::Result<()> {
    let h = Harness::new(ProcessorConfig::immediate());
    h.pack.add_flow(etl()?)?;
    let app = create_app(h.processor.clone());

    let response = app
        .oneshot(start_run("etl", r#"{"params": {"source": "s3://x"}}"#)?)
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);

    let runs = h.store.find_active_flow_runs(&["etl".to_string()]).await?;
    assert_eq!(runs.len(), 1);
    let run = h.run(&runs[0].uid).await?;
    assert_eq!(run.context, json!({ "flow_params": { "source": "s3://x" } }));
    assert!(run.delayed_until.is_none());
    Ok(())
}

#[tokio::test]
async fn start_run_of_unknown_flow_is_not_found() -> anyhow::Result<()> {
    let h = Harness::new(ProcessorConfig::immediate());
    h.pack.add_flow(etl()?)?;
    let app = create_app(h.processor.clone());

    let response = app.oneshot(start_run("reports", r#"{"params": {}}"#)?).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(h.store.find_active_flow_runs(&["etl".to_string()]).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn unknown_run_is_not_found() -> anyhow::Result<()> {
    let h = Harness::new(ProcessorConfig::immediate());
    let app = create_app(h.processor.clone());

    let request = Request::builder()
        .uri(format!("/api/runs/{}", "0".repeat(32)))
        .body(Body::empty())?;
    let response = app.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}
