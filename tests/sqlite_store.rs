//! SQLite store and lock service on a temporary database file

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::etl;
use flowmill::{
    config::ProcessorConfig,
    flow::FlowPack,
    runtime::{DistributedLock, FlowProcessor, LockService, SqliteLockService},
    store::{FlowRunUpdate, FlowStore, NewFlowRun, RunState, SqliteFlowStore},
    LockError,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;

async fn open(dir: &TempDir) -> anyhow::Result<SqliteFlowStore> {
    let url = format!("sqlite://{}", dir.path().join("nested/flows.db").display());
    SqliteFlowStore::connect(&url).await
}

fn new_run(uid: &str, flow_name: &str, offset_secs: i64) -> NewFlowRun {
    NewFlowRun {
        uid: uid.to_string(),
        flow_name: flow_name.to_string(),
        context: json!({ "flow_params": { "uid": uid } }),
        delayed_until: None,
        created_at: Utc::now() + ChronoDuration::seconds(offset_secs),
    }
}

#[tokio::test]
async fn flow_run_round_trip() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open(&dir).await?;

    let inserted = store.insert_flow_run(new_run("run-a", "etl", 0)).await?;
    assert!(inserted.id > 0);

    let loaded = store.get_flow_run("run-a").await?.expect("run exists");
    assert_eq!(loaded.id, inserted.id);
    assert_eq!(loaded.flow_name, "etl");
    assert_eq!(loaded.state, RunState::Active);
    assert_eq!(loaded.context, json!({ "flow_params": { "uid": "run-a" } }));
    assert_eq!(loaded.created_at.timestamp(), inserted.created_at.timestamp());
    assert!(loaded.delayed_until.is_none());
    assert!(loaded.finished_at.is_none());

    assert!(store.get_flow_run("nope").await?.is_none());
    assert!(store.insert_flow_run(new_run("run-a", "etl", 0)).await.is_err());
    Ok(())
}

#[tokio::test]
async fn active_runs_filtered_and_ordered() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open(&dir).await?;

    let late = store.insert_flow_run(new_run("late", "etl", 10)).await?;
    store.insert_flow_run(new_run("early", "etl", 0)).await?;
    store.insert_flow_run(new_run("other", "reports", 5)).await?;
    let done = store.insert_flow_run(new_run("done", "etl", 1)).await?;
    store
        .update_flow_run(done.id, FlowRunUpdate::finish(json!({}), Utc::now()))
        .await?;

    let names = vec!["etl".to_string()];
    let uids: Vec<String> = store
        .find_active_flow_runs(&names)
        .await?
        .into_iter()
        .map(|view| view.uid)
        .collect();
    assert_eq!(uids, vec!["early", "late"]);

    let both = vec!["etl".to_string(), "reports".to_string()];
    assert_eq!(store.find_active_flow_runs(&both).await?.len(), 3);
    assert!(store.find_active_flow_runs(&[]).await?.is_empty());

    let view = store
        .find_active_flow_runs(&names)
        .await?
        .into_iter()
        .find(|view| view.uid == "late")
        .expect("late is active");
    assert_eq!(view.id, late.id);
    Ok(())
}

#[tokio::test]
async fn partial_updates_touch_only_given_fields() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open(&dir).await?;
    let run = store.insert_flow_run(new_run("run-u", "etl", 0)).await?;

    let until = Utc::now() + ChronoDuration::seconds(30);
    assert!(store.update_flow_run(run.id, FlowRunUpdate::delay(json!({ "step": 1 }), until)).await?);
    let delayed = store.get_flow_run("run-u").await?.expect("run exists");
    assert_eq!(delayed.state, RunState::Active);
    assert_eq!(delayed.context, json!({ "step": 1 }));
    assert_eq!(delayed.delayed_until.map(|t| t.timestamp()), Some(until.timestamp()));

    assert!(store.update_flow_run(run.id, FlowRunUpdate::context(json!({ "step": 2 }))).await?);
    let updated = store.get_flow_run("run-u").await?.expect("run exists");
    assert_eq!(updated.context, json!({ "step": 2 }));
    assert!(updated.delayed_until.is_some());

    let cleared = FlowRunUpdate {
        delayed_until: Some(None),
        ..Default::default()
    };
    assert!(store.update_flow_run(run.id, cleared).await?);
    assert!(store.get_flow_run("run-u").await?.expect("run exists").delayed_until.is_none());

    assert!(!store.update_flow_run(run.id + 100, FlowRunUpdate::context(json!({}))).await?);
    Ok(())
}

#[tokio::test]
async fn task_run_lifecycle() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open(&dir).await?;

    let extract = store.insert_task_run("run-t", "extract", Utc::now()).await?;
    let transform = store.insert_task_run("run-t", "transform", Utc::now()).await?;
    store.insert_task_run("run-x", "extract", Utc::now()).await?;

    assert!(store.finish_task_run(extract.id, Utc::now()).await?);
    assert!(store.delete_task_run(transform.id).await?);
    assert!(!store.delete_task_run(transform.id).await?);

    let task_runs = store.find_task_runs("run-t").await?;
    assert_eq!(task_runs.len(), 1);
    assert_eq!(task_runs[0].task_name, "extract");
    assert_eq!(task_runs[0].state, RunState::Finished);
    assert!(task_runs[0].finished_at.is_some());
    Ok(())
}

#[tokio::test]
async fn schema_init_is_idempotent() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open(&dir).await?;
    store.insert_flow_run(new_run("kept", "etl", 0)).await?;

    store.init_schema().await?;
    let reopened = open(&dir).await?;
    assert!(reopened.get_flow_run("kept").await?.is_some());
    Ok(())
}

#[tokio::test]
async fn sqlite_lock_excludes_other_owners() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open(&dir).await?;
    let service = SqliteLockService::new(store.pool().clone(), Duration::from_secs(30));
    service.init_schema().await?;
    let service: Arc<dyn LockService> = Arc::new(service);

    let first = DistributedLock::new(Arc::clone(&service), "proc-a");
    let second = DistributedLock::new(Arc::clone(&service), "proc-b");

    let guard = first.acquire("run-1", Duration::from_millis(50)).await?;
    assert_eq!(guard.key(), "run-1");
    let contended = second.acquire("run-1", Duration::from_millis(30)).await;
    assert!(matches!(contended, Err(LockError::Timeout { .. })));

    // A non-holder cannot release somebody else's key
    service.unlock("run-1", "proc-b").await?;
    assert!(!service.try_lock("run-1", "proc-b").await?);

    guard.release().await?;
    let taken = second.acquire("run-1", Duration::from_millis(50)).await?;
    taken.release().await?;
    Ok(())
}

#[tokio::test]
async fn expired_lease_is_reclaimed() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open(&dir).await?;
    let service = SqliteLockService::new(store.pool().clone(), Duration::from_millis(20));
    service.init_schema().await?;

    assert!(service.try_lock("run-2", "crashed").await?);
    assert!(!service.try_lock("run-2", "survivor").await?);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(service.try_lock("run-2", "survivor").await?);
    Ok(())
}

#[tokio::test]
async fn processor_completes_flow_on_sqlite() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = open(&dir).await?;
    let locks = SqliteLockService::new(store.pool().clone(), Duration::from_secs(30));
    locks.init_schema().await?;

    let pack = Arc::new(FlowPack::new());
    let graph = pack.add_flow(etl()?)?;
    let store: Arc<dyn FlowStore> = Arc::new(store);
    let locks: Arc<dyn LockService> = Arc::new(locks);
    let processor = FlowProcessor::new(pack, Arc::clone(&store), locks, ProcessorConfig::immediate());

    let run = processor.run_flow(&graph, json!({ "source": "s3://x" }), None).await?;
    tokio::time::timeout(Duration::from_secs(10), processor.scheduler(true)).await??;

    let finished = store.get_flow_run(&run.uid).await?.expect("run exists");
    assert_eq!(finished.state, RunState::Finished);
    assert_eq!(finished.context["visited"], json!(["extract", "transform", "load"]));
    assert_eq!(store.find_task_runs(&run.uid).await?.len(), 3);
    Ok(())
}
