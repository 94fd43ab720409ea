//! Ready-task computation
//!
//! Pure function of the graph and the set of finished task names. A successor is
//! ready only once every one of its predecessors is done (AND-join).

use crate::flow::{graph::FlowGraph, task::Task};
use std::{collections::HashSet, sync::Arc};

/// Tasks eligible to start given the names of the tasks already finished
///
/// With nothing done yet this is exactly the graph's heads. Otherwise it is
/// every task not yet done whose predecessors are all done: successors of done
/// tasks once their join is satisfied, plus any head that has not run yet
/// (a head whose attempt was delayed, or one left waiting by serial dispatch).
/// Each task appears once, in declaration order.
pub fn get_tasks_to_run(graph: &FlowGraph, done_task_names: &HashSet<String>) -> Vec<Arc<dyn Task>> {
    if done_task_names.is_empty() {
        return graph.heads();
    }

    graph
        .task_names()
        .into_iter()
        .filter(|name| !done_task_names.contains(*name))
        .filter(|name| {
            graph
                .predecessors(name)
                .iter()
                .all(|pred| done_task_names.contains(*pred))
        })
        .filter_map(|name| graph.task(name).cloned())
        .collect()
}
