//! Flow definition graphs
//!
//! A [`FlowGraph`] is an immutable petgraph DAG of named tasks. Graphs are declared
//! once at startup through a [`FlowBuilder`]:
//!
//! ```ignore
//! let etl = FlowGraph::build("etl", |flow| {
//!     let extract = flow.task(FnTask::new("extract", extract_fn))?;
//!     let transform = flow.task(FnTask::new("transform", transform_fn))?;
//!     flow.precedes(&extract, &transform)?;
//!     Ok(())
//! })?;
//! ```

use crate::{error::ConfigError, flow::task::Task};
use petgraph::{
    algo::{has_path_connecting, toposort},
    graph::{DiGraph, NodeIndex},
    Direction,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{collections::HashMap, fmt, sync::Arc};

/// Validator applied to a run context before each task executes
#[derive(Clone)]
pub struct ContextModel {
    type_name: &'static str,
    validate: Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>,
}

impl ContextModel {
    /// Context must deserialize into `T`
    pub fn of<T: DeserializeOwned + 'static>() -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            validate: Arc::new(|value: &Value| {
                serde_json::from_value::<T>(value.clone())
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }),
        }
    }

    /// Arbitrary validation closure
    pub fn custom<F>(type_name: &'static str, validate: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            type_name,
            validate: Arc::new(validate),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn validate(&self, context: &Value) -> Result<(), String> {
        (self.validate)(context)
    }
}

impl fmt::Debug for ContextModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContextModel").field(&self.type_name).finish()
    }
}

/// Handle to a task registered in a builder, used to declare edges
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskRef {
    flow: String,
    name: String,
}

impl TaskRef {
    pub fn flow(&self) -> &str {
        &self.flow
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Immutable DAG of tasks for one named flow
pub struct FlowGraph {
    name: String,
    /// Node weight = task name
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
    tasks: HashMap<String, Arc<dyn Task>>,
    context_model: Option<ContextModel>,
}

impl FlowGraph {
    /// Scoped construction: run `define` against a fresh builder and freeze the result
    pub fn build<F>(name: impl Into<String>, define: F) -> anyhow::Result<FlowGraph>
    where
        F: FnOnce(&mut FlowBuilder) -> anyhow::Result<()>,
    {
        let mut builder = FlowBuilder::new(name);
        define(&mut builder)?;
        Ok(builder.finish()?)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, task_name: &str) -> bool {
        self.tasks.contains_key(task_name)
    }

    pub fn task(&self, task_name: &str) -> Option<&Arc<dyn Task>> {
        self.tasks.get(task_name)
    }

    /// Task names in declaration order
    pub fn task_names(&self) -> Vec<&str> {
        self.graph.node_indices().map(|idx| self.graph[idx].as_str()).collect()
    }

    pub fn context_model(&self) -> Option<&ContextModel> {
        self.context_model.as_ref()
    }

    /// Tasks with no incoming edges, in declaration order
    pub fn heads(&self) -> Vec<Arc<dyn Task>> {
        let heads: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect();
        self.tasks_at(heads)
    }

    /// Direct dependents of `task_name`, in declaration order
    pub fn successors(&self, task_name: &str) -> Vec<Arc<dyn Task>> {
        let Some(&idx) = self.indices.get(task_name) else {
            return vec![];
        };
        let targets = self.graph.neighbors_directed(idx, Direction::Outgoing).collect();
        self.tasks_at(targets)
    }

    /// Names of the tasks `task_name` waits on
    pub fn predecessors(&self, task_name: &str) -> Vec<&str> {
        let Some(&idx) = self.indices.get(task_name) else {
            return vec![];
        };
        let mut sources: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect();
        sources.sort();
        sources.dedup();
        sources.into_iter().map(|i| self.graph[i].as_str()).collect()
    }

    /// Position of a task in declaration order, used for stable ordering
    pub fn position(&self, task_name: &str) -> Option<usize> {
        self.indices.get(task_name).map(|idx| idx.index())
    }

    fn tasks_at(&self, mut indices: Vec<NodeIndex>) -> Vec<Arc<dyn Task>> {
        indices.sort();
        indices.dedup();
        indices
            .into_iter()
            .filter_map(|idx| self.tasks.get(&self.graph[idx]).cloned())
            .collect()
    }
}

impl fmt::Debug for FlowGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowGraph")
            .field("name", &self.name)
            .field("tasks", &self.task_names())
            .field("edges", &self.graph.edge_count())
            .field("context_model", &self.context_model)
            .finish()
    }
}

/// Mutable builder for a [`FlowGraph`]
pub struct FlowBuilder {
    name: String,
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
    tasks: HashMap<String, Arc<dyn Task>>,
    context_model: Option<ContextModel>,
}

impl FlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graph: DiGraph::new(),
            indices: HashMap::new(),
            tasks: HashMap::new(),
            context_model: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a task; fails if the name is taken
    pub fn task<T: Task + 'static>(&mut self, task: T) -> Result<TaskRef, ConfigError> {
        self.add_task(Arc::new(task))
    }

    pub fn add_task(&mut self, task: Arc<dyn Task>) -> Result<TaskRef, ConfigError> {
        let name = task.name().to_string();
        if self.tasks.contains_key(&name) {
            return Err(ConfigError::DuplicateTask {
                flow: self.name.clone(),
                task: name,
            });
        }

        let idx = self.graph.add_node(name.clone());
        self.indices.insert(name.clone(), idx);
        self.tasks.insert(name.clone(), task);
        tracing::debug!("  ➕ Added task '{}' to flow '{}'", name, self.name);

        Ok(self.task_ref(name))
    }

    /// Register a task unless one with the same name exists; returns the existing one then
    pub fn get_or_add_task(&mut self, task: Arc<dyn Task>) -> TaskRef {
        let name = task.name().to_string();
        if self.tasks.contains_key(&name) {
            return self.task_ref(name);
        }
        let idx = self.graph.add_node(name.clone());
        self.indices.insert(name.clone(), idx);
        self.tasks.insert(name.clone(), task);
        self.task_ref(name)
    }

    /// Look up an already registered task
    pub fn get(&self, task_name: &str) -> Option<TaskRef> {
        self.tasks
            .contains_key(task_name)
            .then(|| self.task_ref(task_name.to_string()))
    }

    /// `to` runs only after `from` completes
    pub fn precedes(&mut self, from: &TaskRef, to: &TaskRef) -> Result<(), ConfigError> {
        if from.flow != self.name || to.flow != self.name {
            return Err(ConfigError::CrossFlowEdge {
                from: from.name.clone(),
                from_flow: from.flow.clone(),
                to: to.name.clone(),
                to_flow: to.flow.clone(),
            });
        }
        self.add_edge(&from.name, &to.name)
    }

    /// Link every consecutive pair: `a -> b -> c`
    pub fn chain(&mut self, tasks: &[&TaskRef]) -> Result<(), ConfigError> {
        for pair in tasks.windows(2) {
            self.precedes(pair[0], pair[1])?;
        }
        Ok(())
    }

    /// Edge by task name; both tasks must already be registered
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), ConfigError> {
        let from_idx = *self.indices.get(from).ok_or_else(|| ConfigError::TaskNotFound {
            flow: self.name.clone(),
            task: from.to_string(),
        })?;
        let to_idx = *self.indices.get(to).ok_or_else(|| ConfigError::TaskNotFound {
            flow: self.name.clone(),
            task: to.to_string(),
        })?;

        if self.graph.find_edge(from_idx, to_idx).is_some() {
            return Ok(());
        }

        // A path to -> from means the new edge closes a loop (covers self edges too)
        if has_path_connecting(&self.graph, to_idx, from_idx, None) {
            return Err(ConfigError::CycleDetected {
                flow: self.name.clone(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        self.graph.add_edge(from_idx, to_idx, ());
        tracing::debug!("  🔗 Added edge: '{}' → '{}' in flow '{}'", from, to, self.name);
        Ok(())
    }

    /// Validate the run context by deserializing it into `T`
    pub fn context_model<T: DeserializeOwned + 'static>(&mut self) -> &mut Self {
        self.context_model = Some(ContextModel::of::<T>());
        self
    }

    pub fn with_context_model(&mut self, model: ContextModel) -> &mut Self {
        self.context_model = Some(model);
        self
    }

    /// Freeze into an immutable graph
    pub fn finish(self) -> Result<FlowGraph, ConfigError> {
        if self.tasks.is_empty() {
            return Err(ConfigError::EmptyFlow(self.name));
        }

        if let Err(cycle) = toposort(&self.graph, None) {
            let at = self.graph[cycle.node_id()].clone();
            return Err(ConfigError::CycleDetected {
                flow: self.name,
                from: at.clone(),
                to: at,
            });
        }

        tracing::debug!(
            "✅ Built flow '{}' with {} tasks and {} edges",
            self.name,
            self.tasks.len(),
            self.graph.edge_count()
        );

        Ok(FlowGraph {
            name: self.name,
            graph: self.graph,
            indices: self.indices,
            tasks: self.tasks,
            context_model: self.context_model,
        })
    }

    fn task_ref(&self, name: String) -> TaskRef {
        TaskRef {
            flow: self.name.clone(),
            name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::task::{FnTask, TaskOutcome};

    fn noop(name: &str) -> FnTask {
        FnTask::new(name, |_ctx, _run| {
            Box::pin(async move { Ok::<_, anyhow::Error>(TaskOutcome::Success) })
        })
    }

    fn names(tasks: &[Arc<dyn Task>]) -> Vec<String> {
        tasks.iter().map(|t| t.name().to_string()).collect()
    }

    #[test]
    fn heads_and_successors_follow_declaration_order() -> anyhow::Result<()> {
        let graph = FlowGraph::build("fan", |flow| {
            let root = flow.task(noop("root"))?;
            let left = flow.task(noop("left"))?;
            let right = flow.task(noop("right"))?;
            flow.task(noop("solo"))?;
            flow.precedes(&root, &right)?;
            flow.precedes(&root, &left)?;
            Ok(())
        })?;

        assert_eq!(names(&graph.heads()), vec!["root", "solo"]);
        assert_eq!(names(&graph.successors("root")), vec!["left", "right"]);
        assert!(graph.successors("missing").is_empty());
        assert_eq!(graph.predecessors("left"), vec!["root"]);
        Ok(())
    }

    #[test]
    fn duplicate_task_fails_loudly() {
        let mut flow = FlowBuilder::new("dup");
        flow.task(noop("a")).unwrap();
        let err = flow.task(noop("a")).unwrap_err();
        assert_eq!(
            err,
            ConfigError::DuplicateTask {
                flow: "dup".into(),
                task: "a".into()
            }
        );

        let existing = flow.get_or_add_task(Arc::new(noop("a")));
        assert_eq!(existing.name(), "a");
    }

    #[test]
    fn edge_to_unknown_task_is_rejected() {
        let mut flow = FlowBuilder::new("edges");
        flow.task(noop("a")).unwrap();
        let err = flow.add_edge("a", "ghost").unwrap_err();
        assert!(matches!(err, ConfigError::TaskNotFound { ref task, .. } if task == "ghost"));
    }

    #[test]
    fn edge_across_flows_is_rejected() {
        let mut first = FlowBuilder::new("first");
        let mut second = FlowBuilder::new("second");
        let a = first.task(noop("a")).unwrap();
        let b = second.task(noop("b")).unwrap();

        let err = first.precedes(&a, &b).unwrap_err();
        assert!(matches!(err, ConfigError::CrossFlowEdge { .. }));
    }

    #[test]
    fn cycles_fail_at_edge_insertion() {
        let mut flow = FlowBuilder::new("loop");
        let a = flow.task(noop("a")).unwrap();
        let b = flow.task(noop("b")).unwrap();
        let c = flow.task(noop("c")).unwrap();
        flow.chain(&[&a, &b, &c]).unwrap();

        assert!(matches!(
            flow.precedes(&c, &a),
            Err(ConfigError::CycleDetected { .. })
        ));
        assert!(matches!(
            flow.precedes(&b, &b),
            Err(ConfigError::CycleDetected { .. })
        ));
    }

    #[test]
    fn empty_flow_is_rejected() {
        let err = FlowBuilder::new("empty").finish().unwrap_err();
        assert_eq!(err, ConfigError::EmptyFlow("empty".into()));
    }

    #[test]
    fn context_model_validates_shape() -> anyhow::Result<()> {
        #[derive(serde::Deserialize)]
        #[allow(dead_code)]
        struct EtlContext {
            flow_params: serde_json::Value,
        }

        let graph = FlowGraph::build("typed", |flow| {
            flow.task(noop("only"))?;
            flow.context_model::<EtlContext>();
            Ok(())
        })?;

        let model = graph.context_model().expect("model installed");
        assert!(model.validate(&serde_json::json!({"flow_params": {}})).is_ok());
        assert!(model.validate(&serde_json::json!({"other": 1})).is_err());
        Ok(())
    }
}
