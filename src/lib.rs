//! Flowmill: persisted flow orchestration engine
//!
//! Flows are DAGs of async tasks declared in code. Runs of a flow live in a
//! store; any number of processors poll that store, lock one run at a time and
//! advance it task by task, honoring delays, stops and failures.

// Core configuration and setup
pub mod config;

// Typed error taxonomy
pub mod error;

// Flow definition layer - tasks, graphs and the flow registry
pub mod flow;

// Persistence layer - flow runs and task runs
pub mod store;

// Runtime scheduling engine - locking, ready-task computation, dispatch
pub mod runtime;

// HTTP API layer - flow listing and run endpoints
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{ConfigError, LockError};
pub use flow::{FlowBuilder, FlowGraph, FlowPack, FlowRunHandle, FnTask, Task, TaskOutcome};
pub use runtime::{FlowProcessor, PassReport};
pub use server::start_server;
pub use store::{FlowRun, FlowStore, TaskRun};
