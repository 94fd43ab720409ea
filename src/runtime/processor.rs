//! Flow processor: the scheduling core
//!
//! A processor polls the store for ACTIVE flow runs of the flows it knows, takes
//! each run's lock, decides which tasks are ready and dispatches them into the
//! background. Each dispatched task reconciles its own outcome into the store.
//!
//! The run lock covers one scheduling decision only and is released before the
//! dispatched task finishes. What keeps a run from getting a second task while
//! one is still executing is the ACTIVE task-run check in
//! [`FlowProcessor::handle_active_flow_run`]; that is why the task run is inserted
//! under the lock, before the task is handed to the dispatcher.

use crate::{
    config::{ProcessorConfig, SiblingDispatch},
    error::{ConfigError, LockError},
    flow::{
        graph::FlowGraph,
        registry::FlowPack,
        task::{Task, TaskOutcome},
    },
    runtime::{
        clock::{to_chrono, Clock, SystemClock},
        dispatch::{DispatchKey, Dispatcher, DrainReport},
        lock::{DistributedLock, LockService},
        scheduling::get_tasks_to_run,
    },
    store::{FlowRun, FlowRunUpdate, FlowRunView, FlowStore, NewFlowRun, RunState, TaskRun},
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::{collections::HashSet, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use uuid::Uuid;

/// Context field holding the parameters a run was started with
pub const FLOW_PARAMS_FIELD: &str = "flow_params";
/// Context field set when the context failed validation
pub const ERROR_FIELD: &str = "_error";
/// Context field set when a run was stopped or a task failed
pub const REASON_FIELD: &str = "_reason";

pub const CODE_VALIDATION_ERROR: &str = "validation-error";
pub const CODE_WORKFLOW_STOPPED: &str = "workflow-stopped";
pub const CODE_EXCEPTION: &str = "exception";

/// What one pass of the scheduler did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// ACTIVE runs returned by the polling query
    pub active_runs: usize,
    /// Runs skipped because `delayed_until` is still in the future
    pub delayed: usize,
    /// Runs skipped because another pass or processor held the lock
    pub locked: usize,
    /// Runs skipped because a task run is still ACTIVE
    pub busy: usize,
    /// `(flow run uid, task name)` pairs dispatched in this pass
    pub dispatched: Vec<(String, String)>,
    /// Runs moved to FINISHED because no task was left to run
    pub finished: Vec<String>,
}

/// Result of handling one locked run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Run no longer exists in the store
    Missing,
    /// Run was already FINISHED
    AlreadyFinished,
    /// Run was pushed back after the polling query read it
    Delayed,
    /// Run references a flow this processor does not define
    UnknownFlow,
    /// A task run is still ACTIVE
    Busy,
    /// Graph exhausted; run marked FINISHED
    Finished,
    /// Names of the tasks handed to the dispatcher
    Dispatched(Vec<String>),
    /// Tasks were ready but the in-flight registry was full
    Saturated,
}

/// Scheduling engine over a flow pack, a store and a lock service
#[derive(Clone)]
pub struct FlowProcessor {
    pack: Arc<FlowPack>,
    store: Arc<dyn FlowStore>,
    lock: DistributedLock,
    clock: Arc<dyn Clock>,
    config: ProcessorConfig,
    dispatcher: Arc<Dispatcher>,
}

impl FlowProcessor {
    pub fn new(
        pack: Arc<FlowPack>,
        store: Arc<dyn FlowStore>,
        locks: Arc<dyn LockService>,
        config: ProcessorConfig,
    ) -> Self {
        let owner = format!("processor-{}", Uuid::new_v4().simple());
        Self {
            pack,
            store,
            lock: DistributedLock::new(locks, owner),
            clock: Arc::new(SystemClock),
            dispatcher: Arc::new(Dispatcher::new(config.max_in_flight)),
            config,
        }
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pack(&self) -> &Arc<FlowPack> {
        &self.pack
    }

    pub fn store(&self) -> &Arc<dyn FlowStore> {
        &self.store
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Identity this processor uses when taking locks
    pub fn owner(&self) -> &str {
        self.lock.owner()
    }

    /// Task executions currently in flight in this process
    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    /// Wait for every dispatched task to reconcile
    pub async fn drain(&self) -> DrainReport {
        self.dispatcher.drain().await
    }

    /// Start a new run of a registered flow
    ///
    /// `params` is stored verbatim under `context.flow_params`. Nothing is
    /// dispatched here; the scheduler loop picks the run up.
    pub async fn run_flow<P: Serialize>(
        &self,
        graph: &FlowGraph,
        params: P,
        delay: Option<Duration>,
    ) -> Result<FlowRun> {
        if !self.pack.flow_exists(graph) {
            return Err(ConfigError::FlowNotFound(graph.name().to_string()).into());
        }
        self.create_run(graph.name(), serde_json::to_value(params)?, delay)
            .await
    }

    /// Start a new run of the flow registered under `flow_name`
    pub async fn run_flow_by_name<P: Serialize>(
        &self,
        flow_name: &str,
        params: P,
        delay: Option<Duration>,
    ) -> Result<FlowRun> {
        let graph = self.pack.get_flow_by_name(flow_name)?;
        self.create_run(graph.name(), serde_json::to_value(params)?, delay)
            .await
    }

    async fn create_run(&self, flow_name: &str, params: Value, delay: Option<Duration>) -> Result<FlowRun> {
        let now = self.clock.now();
        let run = self
            .store
            .insert_flow_run(NewFlowRun {
                uid: Uuid::new_v4().simple().to_string(),
                flow_name: flow_name.to_string(),
                context: json!({ FLOW_PARAMS_FIELD: params }),
                delayed_until: delay.map(|d| after(now, d)),
                created_at: now,
            })
            .await?;

        tracing::info!(
            "🆕 Created flow run {} for flow '{}'{}",
            run.uid,
            run.flow_name,
            run.delayed_until
                .map(|until| format!(" (delayed until {})", until.to_rfc3339()))
                .unwrap_or_default()
        );
        Ok(run)
    }

    /// Main loop; with `once` it returns after a pass that saw no ACTIVE runs
    ///
    /// Errors other than lock contention abort the loop.
    pub async fn scheduler(&self, once: bool) -> Result<()> {
        self.scheduler_loop(once, None).await
    }

    /// Run the scheduler loop on a background task
    pub fn spawn(&self) -> ProcessorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let processor = self.clone();
        let join = tokio::spawn(async move { processor.scheduler_loop(false, Some(shutdown_rx)).await });
        ProcessorHandle {
            processor: self.clone(),
            shutdown_tx,
            join,
        }
    }

    async fn scheduler_loop(&self, once: bool, mut shutdown: Option<watch::Receiver<bool>>) -> Result<()> {
        tracing::info!(
            "⏰ Starting flow scheduler {} for flows {:?}",
            self.owner(),
            self.pack.flow_names()
        );
        tokio::time::sleep(self.config.start_delay).await;

        loop {
            if shutdown.as_ref().is_some_and(|rx| *rx.borrow()) {
                break;
            }

            let report = self.run_pass().await?;
            if once && report.active_runs == 0 {
                break;
            }

            match shutdown.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        changed = rx.changed() => {
                            // Handle dropped without an explicit shutdown
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                None => tokio::time::sleep(self.config.poll_interval).await,
            }
        }

        let drained = self.drain().await;
        tracing::info!(
            "⏹️ Flow scheduler {} stopped ({} in-flight tasks drained)",
            self.owner(),
            drained.joined
        );
        Ok(())
    }

    /// One polling pass over every ACTIVE run, oldest first
    pub async fn run_pass(&self) -> Result<PassReport> {
        self.dispatcher.reap();

        let flow_names = self.pack.flow_names();
        let runs = self.store.find_active_flow_runs(&flow_names).await?;
        let mut report = PassReport {
            active_runs: runs.len(),
            ..Default::default()
        };

        for run in runs {
            if run.delayed_until.is_some_and(|until| until > self.clock.now()) {
                report.delayed += 1;
                continue;
            }

            let guard = match self.lock.acquire(&run.uid, self.config.lock_timeout).await {
                Ok(guard) => guard,
                Err(LockError::Timeout { .. }) => {
                    tracing::debug!("🔒 Flow run {} is locked elsewhere, skipping this pass", run.uid);
                    report.locked += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let handled = self.handle_active_flow_run(&run).await;
            let released = guard.release().await;
            let status = handled?;
            released?;

            match status {
                RunStatus::Busy => report.busy += 1,
                RunStatus::Delayed => report.delayed += 1,
                RunStatus::Finished => report.finished.push(run.uid.clone()),
                RunStatus::Dispatched(tasks) => report
                    .dispatched
                    .extend(tasks.into_iter().map(|task| (run.uid.clone(), task))),
                RunStatus::Missing
                | RunStatus::AlreadyFinished
                | RunStatus::UnknownFlow
                | RunStatus::Saturated => {}
            }
        }

        Ok(report)
    }

    /// Schedule one run; the caller must hold the run's lock
    pub async fn handle_active_flow_run(&self, view: &FlowRunView) -> Result<RunStatus> {
        let Some(flow_run) = self.store.get_flow_run(&view.uid).await? else {
            return Ok(RunStatus::Missing);
        };
        if flow_run.is_finished() {
            return Ok(RunStatus::AlreadyFinished);
        }
        // The polled view may predate a delay requested since
        if flow_run.delayed_until.is_some_and(|until| until > self.clock.now()) {
            return Ok(RunStatus::Delayed);
        }

        let graph = match self.pack.get_flow_by_name(&flow_run.flow_name) {
            Ok(graph) => graph,
            Err(_) => {
                tracing::warn!(
                    "⚠️ Flow run {} references unknown flow '{}'",
                    flow_run.uid,
                    flow_run.flow_name
                );
                return Ok(RunStatus::UnknownFlow);
            }
        };

        let task_runs = self.store.find_task_runs(&flow_run.uid).await?;
        let mut done_task_names = HashSet::new();
        for task_run in &task_runs {
            if !task_run.is_active() {
                done_task_names.insert(task_run.task_name.clone());
                continue;
            }
            if self.recover_stale(task_run).await? {
                continue;
            }
            return Ok(RunStatus::Busy);
        }

        let tasks_to_run = get_tasks_to_run(&graph, &done_task_names);
        if tasks_to_run.is_empty() {
            let now = self.clock.now();
            self.store
                .update_flow_run(
                    flow_run.id,
                    FlowRunUpdate {
                        state: Some(RunState::Finished),
                        finished_at: Some(now),
                        ..Default::default()
                    },
                )
                .await?;
            tracing::info!("🎉 Flow run {} ('{}') finished", flow_run.uid, flow_run.flow_name);
            return Ok(RunStatus::Finished);
        }

        let limit = match self.config.sibling_dispatch {
            SiblingDispatch::Serial => 1,
            SiblingDispatch::Concurrent => tasks_to_run.len(),
        };

        let mut dispatched = Vec::new();
        for task in tasks_to_run.into_iter().take(limit) {
            let Some(permit) = self.dispatcher.try_reserve() else {
                tracing::debug!(
                    "🚦 In-flight limit reached; '{}' of run {} waits for a later pass",
                    task.name(),
                    flow_run.uid
                );
                break;
            };

            let task_run = self.start_task_run(&flow_run, task.as_ref()).await?;
            let key = DispatchKey {
                flow_run_uid: flow_run.uid.clone(),
                task_name: task.name().to_string(),
            };
            dispatched.push(key.task_name.clone());

            let processor = self.clone();
            let graph = Arc::clone(&graph);
            let flow_run = flow_run.clone();
            self.dispatcher.spawn(key, permit, async move {
                processor.execute_task_run(&graph, flow_run, task, task_run).await
            });
        }

        if dispatched.is_empty() {
            return Ok(RunStatus::Saturated);
        }
        Ok(RunStatus::Dispatched(dispatched))
    }

    /// Execute one task of a run in the foreground and reconcile its outcome
    pub async fn run_task(&self, graph: &FlowGraph, flow_run: &FlowRun, task: Arc<dyn Task>) -> Result<()> {
        let task_run = self.start_task_run(flow_run, task.as_ref()).await?;
        self.execute_task_run(graph, flow_run.clone(), task, task_run).await
    }

    async fn start_task_run(&self, flow_run: &FlowRun, task: &dyn Task) -> Result<TaskRun> {
        let task_run = self
            .store
            .insert_task_run(&flow_run.uid, task.name(), self.clock.now())
            .await?;
        tracing::info!("🚀 Dispatching task '{}' of flow run {}", task.name(), flow_run.uid);
        Ok(task_run)
    }

    async fn execute_task_run(
        &self,
        graph: &FlowGraph,
        flow_run: FlowRun,
        task: Arc<dyn Task>,
        task_run: TaskRun,
    ) -> Result<()> {
        let mut context = flow_run.context.clone();

        if let Some(model) = graph.context_model() {
            if let Err(text) = model.validate(&context) {
                self.store.delete_task_run(task_run.id).await?;
                stamp(&mut context, ERROR_FIELD, CODE_VALIDATION_ERROR, &text);
                self.store
                    .update_flow_run(flow_run.id, FlowRunUpdate::finish(context, self.clock.now()))
                    .await?;
                tracing::error!(
                    "❌ Context of flow run {} does not match {}: {}",
                    flow_run.uid,
                    model.type_name(),
                    text
                );
                return Ok(());
            }
        }

        let handle = flow_run.handle();
        let started = std::time::Instant::now();
        let outcome = AssertUnwindSafe(task.run(&mut context, &handle))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                TaskOutcome::Failure(anyhow::anyhow!("task panicked: {}", panic_message(panic.as_ref())))
            });
        let outcome_label = outcome.kind();
        tracing::debug!(
            "Task '{}' of flow run {} returned {}",
            task.name(),
            flow_run.uid,
            outcome_label
        );

        // A sibling may have finished the run while this task executed
        let current = self.store.get_flow_run(&flow_run.uid).await?;
        if current.as_ref().map_or(true, FlowRun::is_finished) {
            match outcome {
                TaskOutcome::Success => {
                    self.store.finish_task_run(task_run.id, self.clock.now()).await?;
                }
                _ => {
                    self.store.delete_task_run(task_run.id).await?;
                }
            }
            tracing::warn!(
                "⚠️ Task '{}' of flow run {} returned {} after the run ended; keeping the final context",
                task.name(),
                flow_run.uid,
                outcome_label
            );
            return Ok(());
        }

        match outcome {
            TaskOutcome::Success => {
                self.store
                    .update_flow_run(flow_run.id, FlowRunUpdate::context(context))
                    .await?;
                self.store.finish_task_run(task_run.id, self.clock.now()).await?;
                tracing::info!(
                    "✅ Task '{}' of flow run {} completed in {:?}",
                    task.name(),
                    flow_run.uid,
                    started.elapsed()
                );
            }
            TaskOutcome::Stop(reason) => {
                stamp(&mut context, REASON_FIELD, CODE_WORKFLOW_STOPPED, &reason);
                self.store
                    .update_flow_run(flow_run.id, FlowRunUpdate::finish(context, self.clock.now()))
                    .await?;
                self.store.delete_task_run(task_run.id).await?;
                tracing::info!(
                    "⏹️ Task '{}' stopped flow run {}: {}",
                    task.name(),
                    flow_run.uid,
                    reason
                );
            }
            TaskOutcome::Delay(delay) => {
                let until = after(self.clock.now(), delay);
                self.store
                    .update_flow_run(flow_run.id, FlowRunUpdate::delay(context, until))
                    .await?;
                self.store.delete_task_run(task_run.id).await?;
                tracing::info!(
                    "⏸️ Task '{}' of flow run {} delayed {:?} (until {})",
                    task.name(),
                    flow_run.uid,
                    delay,
                    until.to_rfc3339()
                );
            }
            TaskOutcome::Failure(error) => {
                stamp(&mut context, REASON_FIELD, CODE_EXCEPTION, &format!("{:#}", error));
                self.store
                    .update_flow_run(flow_run.id, FlowRunUpdate::finish(context, self.clock.now()))
                    .await?;
                self.store.delete_task_run(task_run.id).await?;
                tracing::error!(
                    "❌ Task '{}' of flow run {} failed: {:?}",
                    task.name(),
                    flow_run.uid,
                    error
                );
            }
        }

        Ok(())
    }

    /// Delete an ACTIVE task run abandoned by a crashed processor
    ///
    /// Only applies when `stale_task_run_after` is configured and the attempt is
    /// not executing in this process.
    async fn recover_stale(&self, task_run: &TaskRun) -> Result<bool> {
        let Some(stale_after) = self.config.stale_task_run_after else {
            return Ok(false);
        };
        if self.dispatcher.is_running(&task_run.flow_run_uid, &task_run.task_name) {
            return Ok(false);
        }
        if self.clock.now() - task_run.created_at < to_chrono(stale_after) {
            return Ok(false);
        }

        self.store.delete_task_run(task_run.id).await?;
        tracing::warn!(
            "♻️ Recovered stale task run '{}' of flow run {} (started {})",
            task_run.task_name,
            task_run.flow_run_uid,
            task_run.created_at.to_rfc3339()
        );
        Ok(true)
    }
}

/// Background scheduler started by [`FlowProcessor::spawn`]
pub struct ProcessorHandle {
    processor: FlowProcessor,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<Result<()>>,
}

impl ProcessorHandle {
    pub fn processor(&self) -> &FlowProcessor {
        &self.processor
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop after the current pass and wait for in-flight tasks
    pub async fn shutdown(self) -> Result<DrainReport> {
        let _ = self.shutdown_tx.send(true);
        self.join.await??;
        Ok(self.processor.drain().await)
    }
}

/// Record `{code, text}` under `field`, keeping the context an object
fn stamp(context: &mut Value, field: &str, code: &str, text: &str) {
    if !context.is_object() {
        let previous = context.take();
        *context = json!({ "_context": previous });
    }
    if let Some(map) = context.as_object_mut() {
        map.insert(field.to_string(), json!({ "code": code, "text": text }));
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now.checked_add_signed(to_chrono(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
