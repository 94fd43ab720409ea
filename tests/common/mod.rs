//! Shared fixtures for integration tests

#![allow(dead_code)]

use flowmill::{
    config::ProcessorConfig,
    flow::{FlowGraph, FlowPack, FnTask, TaskOutcome},
    runtime::{FlowProcessor, LocalLockService, LockService, ManualClock},
    store::{FlowRun, FlowStore, MemoryFlowStore},
};
use serde_json::json;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Processor over an in-memory store, local locks and a manual clock
pub struct Harness {
    pub pack: Arc<FlowPack>,
    pub store: Arc<dyn FlowStore>,
    pub locks: Arc<LocalLockService>,
    pub clock: Arc<ManualClock>,
    pub processor: FlowProcessor,
}

impl Harness {
    pub fn new(config: ProcessorConfig) -> Self {
        let pack = Arc::new(FlowPack::new());
        let store: Arc<dyn FlowStore> = Arc::new(MemoryFlowStore::new());
        let locks = Arc::new(LocalLockService::new());
        let clock = Arc::new(ManualClock::default());
        let processor = Self::processor_on(&pack, &store, &locks, &clock, config);
        Self {
            pack,
            store,
            locks,
            clock,
            processor,
        }
    }

    /// Another processor sharing this harness' store, locks and clock
    pub fn sibling(&self, config: ProcessorConfig) -> FlowProcessor {
        Self::processor_on(&self.pack, &self.store, &self.locks, &self.clock, config)
    }

    fn processor_on(
        pack: &Arc<FlowPack>,
        store: &Arc<dyn FlowStore>,
        locks: &Arc<LocalLockService>,
        clock: &Arc<ManualClock>,
        config: ProcessorConfig,
    ) -> FlowProcessor {
        let locks: Arc<dyn LockService> = locks.clone();
        FlowProcessor::new(Arc::clone(pack), Arc::clone(store), locks, config).with_clock(clock.clone())
    }

    pub async fn run(&self, uid: &str) -> anyhow::Result<FlowRun> {
        self.store
            .get_flow_run(uid)
            .await?
            .ok_or_else(|| anyhow::anyhow!("flow run {} disappeared", uid))
    }

    pub async fn active_task_runs(&self, uid: &str) -> anyhow::Result<usize> {
        Ok(self
            .store
            .find_task_runs(uid)
            .await?
            .iter()
            .filter(|task_run| task_run.is_active())
            .count())
    }
}

/// Task that appends its name to `context.visited` and counts its invocations
pub fn recording(name: &'static str, calls: Arc<AtomicUsize>) -> FnTask {
    FnTask::new(name, move |ctx, _run| {
        let calls = Arc::clone(&calls);
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            match ctx.get_mut("visited").and_then(|v| v.as_array_mut()) {
                Some(visited) => visited.push(json!(name)),
                None => ctx["visited"] = json!([name]),
            }
            Ok::<_, anyhow::Error>(TaskOutcome::Success)
        })
    })
}

pub fn noop(name: &'static str) -> FnTask {
    recording(name, Arc::new(AtomicUsize::new(0)))
}

/// extract -> transform -> load
pub fn etl() -> anyhow::Result<FlowGraph> {
    FlowGraph::build("etl", |flow| {
        let extract = flow.task(noop("extract"))?;
        let transform = flow.task(noop("transform"))?;
        let load = flow.task(noop("load"))?;
        flow.chain(&[&extract, &transform, &load])?;
        Ok(())
    })
}

/// a -> b, a -> c, b -> d, c -> d
pub fn diamond() -> anyhow::Result<FlowGraph> {
    FlowGraph::build("diamond", |flow| {
        let a = flow.task(noop("a"))?;
        let b = flow.task(noop("b"))?;
        let c = flow.task(noop("c"))?;
        let d = flow.task(noop("d"))?;
        flow.precedes(&a, &b)?;
        flow.precedes(&a, &c)?;
        flow.precedes(&b, &d)?;
        flow.precedes(&c, &d)?;
        Ok(())
    })
}

pub fn dispatched_tasks(report: &flowmill::PassReport) -> Vec<&str> {
    report
        .dispatched
        .iter()
        .map(|(_, task)| task.as_str())
        .collect()
}
