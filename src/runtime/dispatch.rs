//! Bounded registry of dispatched task executions
//!
//! Every dispatched task runs as a future inside a `JoinSet`, gated by a
//! semaphore so one process never has more than `max_in_flight` tasks running.
//! The registry also remembers which `(flow run, task)` pairs are executing here,
//! which lets stale-run recovery tell a crashed attempt from a slow local one.

use std::{
    collections::HashSet,
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
};

/// Identifies one dispatched task execution
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DispatchKey {
    pub flow_run_uid: String,
    pub task_name: String,
}

/// Outcome of waiting for all in-flight work
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Futures joined during the drain
    pub joined: usize,
    /// Reconciliation errors and panics, rendered for logging
    pub errors: Vec<String>,
}

#[derive(Debug)]
pub struct Dispatcher {
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<anyhow::Result<()>>>,
    running: Arc<Mutex<HashSet<DispatchKey>>>,
}

impl Dispatcher {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            tasks: Mutex::new(JoinSet::new()),
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Reserve a slot, or `None` when the registry is full
    pub fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).try_acquire_owned().ok()
    }

    /// Run `work` in the background under `permit`
    pub fn spawn<F>(&self, key: DispatchKey, permit: OwnedSemaphorePermit, work: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        lock(&self.running).insert(key.clone());
        let running = Arc::clone(&self.running);

        lock(&self.tasks).spawn(async move {
            let result = work.await;
            lock(&running).remove(&key);
            drop(permit);
            if let Err(e) = &result {
                tracing::error!(
                    "❌ Dispatch of '{}' for run {} failed to reconcile: {:#}",
                    key.task_name,
                    key.flow_run_uid,
                    e
                );
            }
            result
        });
    }

    /// Number of task executions currently in flight
    pub fn in_flight(&self) -> usize {
        lock(&self.running).len()
    }

    pub fn is_running(&self, flow_run_uid: &str, task_name: &str) -> bool {
        lock(&self.running).contains(&DispatchKey {
            flow_run_uid: flow_run_uid.to_string(),
            task_name: task_name.to_string(),
        })
    }

    /// Drop bookkeeping for futures that already completed
    pub fn reap(&self) -> usize {
        let mut tasks = lock(&self.tasks);
        let mut reaped = 0;
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                tracing::error!("❌ Dispatched task aborted: {}", e);
            }
            reaped += 1;
        }
        reaped
    }

    /// Wait for every in-flight execution, including ones spawned while draining
    pub async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        loop {
            let mut batch = std::mem::take(&mut *lock(&self.tasks));
            if batch.is_empty() {
                return report;
            }
            while let Some(joined) = batch.join_next().await {
                report.joined += 1;
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => report.errors.push(format!("{:#}", e)),
                    Err(e) => report.errors.push(format!("task aborted: {}", e)),
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
