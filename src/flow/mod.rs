//! Flow definition layer
//!
//! Declares flows as task DAGs and keeps them in a process-wide registry:
//! - Task trait, outcomes and the callback task variant
//! - petgraph-backed flow graphs with a scoped builder
//! - FlowPack registry looked up by the processor

// Task abstraction and outcomes
pub mod task;

// DAG definition and builder
pub mod graph;

// Name-keyed registry of flow graphs
pub mod registry;

pub use graph::{ContextModel, FlowBuilder, FlowGraph, TaskRef};
pub use registry::FlowPack;
pub use task::{FlowRunHandle, FnTask, Task, TaskOutcome};
