//! Persisted record types
//!
//! `FlowRun` is the durable source of truth for one execution of a flow graph;
//! `TaskRun` records progress of one task inside it.

use crate::flow::task::FlowRunHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state shared by flow runs and task runs, stored as an int enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Active,
    Finished,
}

impl RunState {
    pub fn as_i64(self) -> i64 {
        match self {
            RunState::Active => 1,
            RunState::Finished => 2,
        }
    }

    pub fn from_i64(value: i64) -> anyhow::Result<Self> {
        match value {
            1 => Ok(RunState::Active),
            2 => Ok(RunState::Finished),
            other => Err(anyhow::anyhow!("unknown run state: {}", other)),
        }
    }
}

/// One execution instance of a flow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRun {
    /// Store-assigned identity
    pub id: i64,
    /// Random hex token used for correlation and locking
    pub uid: String,
    pub flow_name: String,
    pub state: RunState,
    /// Mutable payload threaded through every task of the run
    pub context: Value,
    pub delayed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl FlowRun {
    pub fn is_finished(&self) -> bool {
        self.state == RunState::Finished
    }

    pub fn handle(&self) -> FlowRunHandle {
        FlowRunHandle {
            uid: self.uid.clone(),
            flow_name: self.flow_name.clone(),
            created_at: self.created_at,
            delayed_until: self.delayed_until,
        }
    }
}

/// Fields needed to insert a flow run; the store assigns `id`
#[derive(Debug, Clone)]
pub struct NewFlowRun {
    pub uid: String,
    pub flow_name: String,
    pub context: Value,
    pub delayed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Projection returned by the active-run polling query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRunView {
    pub id: i64,
    pub uid: String,
    pub flow_name: String,
    pub delayed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&FlowRun> for FlowRunView {
    fn from(run: &FlowRun) -> Self {
        Self {
            id: run.id,
            uid: run.uid.clone(),
            flow_name: run.flow_name.clone(),
            delayed_until: run.delayed_until,
            created_at: run.created_at,
        }
    }
}

/// Partial update of a flow run; `None` leaves a field untouched
#[derive(Debug, Clone, Default)]
pub struct FlowRunUpdate {
    pub state: Option<RunState>,
    pub context: Option<Value>,
    /// `Some(None)` clears the delay
    pub delayed_until: Option<Option<DateTime<Utc>>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl FlowRunUpdate {
    /// Persist a new context only
    pub fn context(context: Value) -> Self {
        Self {
            context: Some(context),
            ..Default::default()
        }
    }

    /// Terminal transition together with the final context
    pub fn finish(context: Value, at: DateTime<Utc>) -> Self {
        Self {
            state: Some(RunState::Finished),
            context: Some(context),
            finished_at: Some(at),
            ..Default::default()
        }
    }

    /// Push the run back until `until`
    pub fn delay(context: Value, until: DateTime<Utc>) -> Self {
        Self {
            context: Some(context),
            delayed_until: Some(Some(until)),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_none()
            && self.context.is_none()
            && self.delayed_until.is_none()
            && self.finished_at.is_none()
    }

    /// Apply to an in-memory record
    pub fn apply(&self, run: &mut FlowRun) {
        if let Some(state) = self.state {
            run.state = state;
        }
        if let Some(context) = &self.context {
            run.context = context.clone();
        }
        if let Some(delayed_until) = self.delayed_until {
            run.delayed_until = delayed_until;
        }
        if let Some(finished_at) = self.finished_at {
            run.finished_at = Some(finished_at);
        }
    }
}

/// Progress record of one task inside one flow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: i64,
    pub flow_run_uid: String,
    pub task_name: String,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRun {
    pub fn is_active(&self) -> bool {
        self.state == RunState::Active
    }
}
