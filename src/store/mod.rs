//! Persistence layer for flow runs and task runs
//!
//! The processor talks to storage only through [`FlowStore`], so the backing
//! store is swappable:
//! - [`SqliteFlowStore`]: sqlx/SQLite, shared by every processor pointed at the same file
//! - [`MemoryFlowStore`]: in-process, for tests and single-process embedding

use async_trait::async_trait;
use chrono::{DateTime, Utc};

// Record types
pub mod types;

// SQLite backend
pub mod sqlite;

// In-process backend
pub mod memory;

pub use memory::MemoryFlowStore;
pub use sqlite::SqliteFlowStore;
pub use types::{FlowRun, FlowRunUpdate, FlowRunView, NewFlowRun, RunState, TaskRun};

/// Document-store operations consumed by the processor
///
/// Every mutation is a single-record update; nothing here assumes transactions
/// spanning several records.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Insert a flow run in state ACTIVE and return it with its assigned id
    async fn insert_flow_run(&self, run: NewFlowRun) -> anyhow::Result<FlowRun>;

    /// ACTIVE runs whose flow name is in `flow_names`, oldest first
    async fn find_active_flow_runs(&self, flow_names: &[String]) -> anyhow::Result<Vec<FlowRunView>>;

    async fn get_flow_run(&self, uid: &str) -> anyhow::Result<Option<FlowRun>>;

    /// Apply a partial update; returns false when the run no longer exists
    async fn update_flow_run(&self, id: i64, update: FlowRunUpdate) -> anyhow::Result<bool>;

    /// Insert an ACTIVE task run and return it
    async fn insert_task_run(
        &self,
        flow_run_uid: &str,
        task_name: &str,
        created_at: DateTime<Utc>,
    ) -> anyhow::Result<TaskRun>;

    /// All task runs of a flow run, oldest first
    async fn find_task_runs(&self, flow_run_uid: &str) -> anyhow::Result<Vec<TaskRun>>;

    async fn finish_task_run(&self, id: i64, finished_at: DateTime<Utc>) -> anyhow::Result<bool>;

    async fn delete_task_run(&self, id: i64) -> anyhow::Result<bool>;
}
