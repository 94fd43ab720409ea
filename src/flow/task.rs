//! Task abstraction
//!
//! A task is a named unit of user code. Its `run` receives the mutable run context
//! and a read-only view of the owning flow run, and reports back one of four
//! outcomes. Delay and stop are ordinary variants rather than errors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::{fmt, time::Duration};

/// What happened when a task ran
#[derive(Debug)]
pub enum TaskOutcome {
    /// Task completed; the context is persisted and the task counts as done.
    Success,
    /// Re-select this task once the delay has elapsed. The task is not marked done.
    Delay(Duration),
    /// End the whole flow run gracefully with the given reason.
    Stop(String),
    /// Unexpected failure; terminal for the flow run.
    Failure(anyhow::Error),
}

impl TaskOutcome {
    pub fn delay_secs(seconds: u64) -> Self {
        TaskOutcome::Delay(Duration::from_secs(seconds))
    }

    pub fn stop(reason: impl Into<String>) -> Self {
        TaskOutcome::Stop(reason.into())
    }

    /// Short label used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            TaskOutcome::Success => "success",
            TaskOutcome::Delay(_) => "delay",
            TaskOutcome::Stop(_) => "stop",
            TaskOutcome::Failure(_) => "failure",
        }
    }
}

impl From<anyhow::Error> for TaskOutcome {
    fn from(error: anyhow::Error) -> Self {
        TaskOutcome::Failure(error)
    }
}

/// Read-only view of the flow run a task executes in
#[derive(Debug, Clone, Serialize)]
pub struct FlowRunHandle {
    pub uid: String,
    pub flow_name: String,
    pub created_at: DateTime<Utc>,
    pub delayed_until: Option<DateTime<Utc>>,
}

/// A unit of work inside a flow graph
#[async_trait]
pub trait Task: Send + Sync {
    /// Name, unique within the owning flow
    fn name(&self) -> &str;

    /// Execute the task against the run context
    async fn run(&self, context: &mut Value, flow_run: &FlowRunHandle) -> TaskOutcome;
}

type TaskFn = dyn for<'a> Fn(&'a mut Value, &'a FlowRunHandle) -> BoxFuture<'a, anyhow::Result<TaskOutcome>>
    + Send
    + Sync;

/// Task backed by a callback
///
/// The callback returns `anyhow::Result<TaskOutcome>` so user code can use `?`;
/// an `Err` becomes [`TaskOutcome::Failure`].
///
/// ```ignore
/// let extract = FnTask::new("extract", |ctx, _run| Box::pin(async move {
///     ctx["rows"] = serde_json::json!(42);
///     Ok::<_, anyhow::Error>(TaskOutcome::Success)
/// }));
/// ```
pub struct FnTask {
    name: String,
    callback: Box<TaskFn>,
}

impl FnTask {
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: for<'a> Fn(&'a mut Value, &'a FlowRunHandle) -> BoxFuture<'a, anyhow::Result<TaskOutcome>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            callback: Box::new(callback),
        }
    }
}

impl fmt::Debug for FnTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask").field("name", &self.name).finish()
    }
}

#[async_trait]
impl Task for FnTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, context: &mut Value, flow_run: &FlowRunHandle) -> TaskOutcome {
        match (self.callback)(context, flow_run).await {
            Ok(outcome) => outcome,
            Err(e) => TaskOutcome::Failure(e),
        }
    }
}
