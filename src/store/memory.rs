//! In-process flow store
//!
//! Same semantics as the SQLite backend, kept behind a mutex. Nothing is shared
//! across processes, so this only suits tests and single-process hosts.

use crate::store::{
    types::{FlowRun, FlowRunUpdate, FlowRunView, NewFlowRun, RunState, TaskRun},
    FlowStore,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::BTreeMap, sync::Mutex};

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    /// Key: store id
    flow_runs: BTreeMap<i64, FlowRun>,
    /// Key: store id
    task_runs: BTreeMap<i64, TaskRun>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Mutex-guarded in-memory [`FlowStore`]
#[derive(Debug, Default)]
pub struct MemoryFlowStore {
    tables: Mutex<Tables>,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow::anyhow!("memory flow store mutex poisoned"))
    }
}

#[async_trait]
impl FlowStore for MemoryFlowStore {
    async fn insert_flow_run(&self, run: NewFlowRun) -> Result<FlowRun> {
        let mut tables = self.lock()?;
        if tables.flow_runs.values().any(|existing| existing.uid == run.uid) {
            return Err(anyhow::anyhow!("flow run uid already exists: {}", run.uid));
        }

        let id = tables.next_id();
        let record = FlowRun {
            id,
            uid: run.uid,
            flow_name: run.flow_name,
            state: RunState::Active,
            context: run.context,
            delayed_until: run.delayed_until,
            created_at: run.created_at,
            finished_at: None,
        };
        tables.flow_runs.insert(id, record.clone());
        Ok(record)
    }

    async fn find_active_flow_runs(&self, flow_names: &[String]) -> Result<Vec<FlowRunView>> {
        let tables = self.lock()?;
        let mut runs: Vec<FlowRunView> = tables
            .flow_runs
            .values()
            .filter(|run| run.state == RunState::Active && flow_names.contains(&run.flow_name))
            .map(FlowRunView::from)
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(runs)
    }

    async fn get_flow_run(&self, uid: &str) -> Result<Option<FlowRun>> {
        let tables = self.lock()?;
        Ok(tables.flow_runs.values().find(|run| run.uid == uid).cloned())
    }

    async fn update_flow_run(&self, id: i64, update: FlowRunUpdate) -> Result<bool> {
        let mut tables = self.lock()?;
        match tables.flow_runs.get_mut(&id) {
            Some(run) => {
                update.apply(run);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_task_run(
        &self,
        flow_run_uid: &str,
        task_name: &str,
        created_at: DateTime<Utc>,
    ) -> Result<TaskRun> {
        let mut tables = self.lock()?;
        let id = tables.next_id();
        let record = TaskRun {
            id,
            flow_run_uid: flow_run_uid.to_string(),
            task_name: task_name.to_string(),
            state: RunState::Active,
            created_at,
            finished_at: None,
        };
        tables.task_runs.insert(id, record.clone());
        Ok(record)
    }

    async fn find_task_runs(&self, flow_run_uid: &str) -> Result<Vec<TaskRun>> {
        let tables = self.lock()?;
        Ok(tables
            .task_runs
            .values()
            .filter(|task_run| task_run.flow_run_uid == flow_run_uid)
            .cloned()
            .collect())
    }

    async fn finish_task_run(&self, id: i64, finished_at: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.lock()?;
        match tables.task_runs.get_mut(&id) {
            Some(task_run) => {
                task_run.state = RunState::Finished;
                task_run.finished_at = Some(finished_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_task_run(&self, id: i64) -> Result<bool> {
        let mut tables = self.lock()?;
        Ok(tables.task_runs.remove(&id).is_some())
    }
}
