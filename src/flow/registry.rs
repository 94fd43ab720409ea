//! Process-wide flow registry
//!
//! Lock-free reads through ArcSwap: the processor looks flows up on every pass
//! while registration, which happens at startup, swaps in a fresh map.

use crate::{error::ConfigError, flow::graph::FlowGraph};
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// Registry of flow definitions keyed by flow name
#[derive(Debug)]
pub struct FlowPack {
    /// Key: flow name, Value: immutable graph
    flows: ArcSwap<HashMap<String, Arc<FlowGraph>>>,
}

impl FlowPack {
    pub fn new() -> Self {
        Self {
            flows: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Register a flow; fails if the name is already taken
    pub fn add_flow(&self, graph: FlowGraph) -> Result<Arc<FlowGraph>, ConfigError> {
        let graph = Arc::new(graph);
        let name = graph.name().to_string();

        let mut collision = false;
        self.flows.rcu(|current| {
            collision = current.contains_key(&name);
            let mut next = (**current).clone();
            if !collision {
                next.insert(name.clone(), Arc::clone(&graph));
            }
            next
        });

        if collision {
            return Err(ConfigError::DuplicateFlow(name));
        }

        tracing::info!("📊 Registered flow '{}' ({} tasks)", name, graph.len());
        Ok(graph)
    }

    /// Get a flow by name (lock-free read)
    pub fn get_flow_by_name(&self, name: &str) -> Result<Arc<FlowGraph>, ConfigError> {
        self.flows
            .load()
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::FlowNotFound(name.to_string()))
    }

    /// True when this exact graph instance is the one registered under its name
    pub fn flow_exists(&self, graph: &FlowGraph) -> bool {
        self.flows
            .load()
            .get(graph.name())
            .is_some_and(|registered| std::ptr::eq(registered.as_ref(), graph))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.flows.load().contains_key(name)
    }

    /// Registered flow names, sorted
    pub fn flow_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.flows.load().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.flows.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.load().is_empty()
    }
}

impl Default for FlowPack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::task::{FnTask, TaskOutcome};

    fn single(name: &str) -> FlowGraph {
        FlowGraph::build(name, |flow| {
            flow.task(FnTask::new("only", |_ctx, _run| {
                Box::pin(async move { Ok::<_, anyhow::Error>(TaskOutcome::Success) })
            }))?;
            Ok(())
        })
        .unwrap()
    }

    #[test]
    fn add_and_lookup() {
        let pack = FlowPack::new();
        let etl = pack.add_flow(single("etl")).unwrap();
        pack.add_flow(single("audit")).unwrap();

        assert!(pack.flow_exists(&etl));
        assert_eq!(pack.flow_names(), vec!["audit", "etl"]);
        assert_eq!(pack.get_flow_by_name("etl").unwrap().name(), "etl");
        assert_eq!(
            pack.get_flow_by_name("nope").unwrap_err(),
            ConfigError::FlowNotFound("nope".into())
        );
    }

    #[test]
    fn duplicate_names_collide() {
        let pack = FlowPack::new();
        pack.add_flow(single("etl")).unwrap();
        let err = pack.add_flow(single("etl")).unwrap_err();
        assert_eq!(err, ConfigError::DuplicateFlow("etl".into()));
        assert_eq!(pack.len(), 1);
    }

    #[test]
    fn unregistered_graph_does_not_exist() {
        let pack = FlowPack::new();
        pack.add_flow(single("etl")).unwrap();
        let stray = single("etl");
        assert!(!pack.flow_exists(&stray));
    }
}
