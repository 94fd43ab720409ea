//! Runtime Scheduling Engine
//!
//! This module drives persisted flow runs through their graphs. It handles:
//! - Polling ACTIVE runs and taking their distributed locks
//! - Computing ready tasks with AND-join semantics
//! - Dispatching tasks into a bounded in-flight registry
//! - Reconciling task outcomes (success, delay, stop, failure) into the store

// Time source, swappable for deterministic delays
pub mod clock;

// Keyed mutual exclusion across processors
pub mod lock;

// Pure ready-task computation
pub mod scheduling;

// Bounded registry of in-flight task executions
pub mod dispatch;

// FlowProcessor: run creation, scheduler loop, outcome reconciliation
pub mod processor;

// Re-export main types
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::DrainReport;
pub use lock::{DistributedLock, LocalLockService, LockGuard, LockService, SqliteLockService};
pub use processor::{FlowProcessor, PassReport, ProcessorHandle, RunStatus};
pub use scheduling::get_tasks_to_run;
