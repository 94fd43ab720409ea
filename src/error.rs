//! Typed errors for flow setup and locking
//!
//! Everything else in the crate travels as `anyhow::Error`. These two enums exist
//! so callers can tell configuration mistakes and lock contention apart from
//! genuine failures with `downcast_ref`.

use thiserror::Error;

/// Setup-time mistakes in flow definitions or lookups
///
/// Raised synchronously while building graphs or registering flows and never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("flow '{0}' is already registered")]
    DuplicateFlow(String),

    #[error("task '{task}' is not registered in flow '{flow}'")]
    TaskNotFound { flow: String, task: String },

    #[error("task '{task}' is already registered in flow '{flow}'")]
    DuplicateTask { flow: String, task: String },

    #[error("cannot link '{from}' ({from_flow}) to '{to}' ({to_flow}): tasks belong to different flows")]
    CrossFlowEdge {
        from: String,
        from_flow: String,
        to: String,
        to_flow: String,
    },

    #[error("edge '{from}' -> '{to}' would create a cycle in flow '{flow}'")]
    CycleDetected {
        flow: String,
        from: String,
        to: String,
    },

    #[error("flow '{0}' has no tasks")]
    EmptyFlow(String),
}

/// Failure modes of the distributed lock
#[derive(Debug, Error)]
pub enum LockError {
    /// Somebody else holds the key. Expected; the caller retries on a later pass.
    #[error("timed out acquiring lock '{key}'")]
    Timeout { key: String },

    /// Storage behind the lock failed
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}
