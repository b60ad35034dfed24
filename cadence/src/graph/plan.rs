//! Dependency graph and execution planning for workflows.
//!
//! The graph uses a bidirectional adjacency list representation:
//! - `successors`: nodes that depend on this node (outgoing edges)
//! - `predecessors`: nodes this node depends on (incoming edges)
//!
//! Both the planner and the runner drive Kahn's algorithm off this structure,
//! so a workflow that plans cleanly is exactly a workflow the runner can
//! finish.

use super::workflow::Workflow;
use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Default)]
struct GraphNode {
    /// Nodes that must complete before this node can run (incoming edges)
    predecessors: Vec<String>,
    /// Nodes that depend on this node (outgoing edges)
    successors: Vec<String>,
}

/// Topology of a workflow, detached from its handlers.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    workflow_id: String,
    nodes: HashMap<String, GraphNode>,
    /// Insertion order for deterministic iteration
    insertion_order: Vec<String>,
}

impl DependencyGraph {
    /// Builds the graph from a workflow's `depends_on` edges.
    ///
    /// Returns `Dependency` if any edge points at a node that does not exist.
    pub fn from_workflow(workflow: &Workflow) -> Result<Self> {
        let mut nodes: HashMap<String, GraphNode> = workflow
            .nodes()
            .iter()
            .map(|node| (node.id().to_string(), GraphNode::default()))
            .collect();

        for node in workflow.nodes() {
            for dependency in node.dependencies() {
                if !nodes.contains_key(dependency) {
                    return Err(Error::dependency(node.id(), dependency.as_str()));
                }
                if let Some(entry) = nodes.get_mut(dependency) {
                    entry.successors.push(node.id().to_string());
                }
            }
            if let Some(entry) = nodes.get_mut(node.id()) {
                entry.predecessors = node.dependencies().to_vec();
            }
        }

        Ok(Self {
            workflow_id: workflow.id().to_string(),
            nodes,
            insertion_order: workflow.nodes().iter().map(|n| n.id().to_string()).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.insertion_order.iter().map(String::as_str)
    }

    /// Nodes that depend on `id`, in the order the edges were declared.
    pub fn successors(&self, id: &str) -> &[String] {
        self.nodes
            .get(id)
            .map(|node| node.successors.as_slice())
            .unwrap_or_default()
    }

    /// Nodes `id` depends on.
    pub fn predecessors(&self, id: &str) -> &[String] {
        self.nodes
            .get(id)
            .map(|node| node.predecessors.as_slice())
            .unwrap_or_default()
    }

    /// Computes in-degrees for all nodes
    pub fn in_degrees(&self) -> HashMap<String, usize> {
        self.nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.predecessors.len()))
            .collect()
    }

    /// Nodes with no dependencies, in insertion order.
    pub fn roots(&self) -> Vec<String> {
        self.insertion_order
            .iter()
            .filter(|id| self.predecessors(id).is_empty())
            .cloned()
            .collect()
    }

    /// Groups nodes into levels using Kahn's algorithm.
    ///
    /// Level `n` holds the nodes whose dependencies all sit in levels
    /// `< n`. Within a level, nodes keep insertion order.
    ///
    /// # Algorithm
    ///
    /// 1. Compute in-degree for all nodes
    /// 2. The current level is every node with in-degree 0
    /// 3. Emit the level; decrement the in-degree of each successor; the
    ///    successors reaching 0 form the next level
    /// 4. If fewer nodes were emitted than exist, the rest sit on a cycle
    pub fn plan(&self) -> Result<ExecutionPlan> {
        let mut in_degrees = self.in_degrees();
        let mut levels = Vec::new();
        let mut emitted = 0usize;

        let mut current: Vec<String> = self.roots();
        while !current.is_empty() {
            let mut released: HashSet<&str> = HashSet::new();
            for id in &current {
                for successor in self.successors(id) {
                    if let Some(degree) = in_degrees.get_mut(successor) {
                        *degree -= 1;
                        if *degree == 0 {
                            released.insert(successor.as_str());
                        }
                    }
                }
            }
            emitted += current.len();
            let next = self
                .insertion_order
                .iter()
                .filter(|id| released.contains(id.as_str()))
                .cloned()
                .collect();
            levels.push(std::mem::replace(&mut current, next));
        }

        if emitted != self.nodes.len() {
            return Err(Error::cyclic(
                self.workflow_id.clone(),
                self.unresolved(&in_degrees),
            ));
        }

        Ok(ExecutionPlan {
            workflow_id: self.workflow_id.clone(),
            levels,
        })
    }

    /// Returns a valid topological ordering of the nodes.
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        let mut in_degrees = self.in_degrees();
        let mut queue: VecDeque<String> = self.roots().into();
        let mut result = Vec::with_capacity(self.nodes.len());

        while let Some(id) = queue.pop_front() {
            for successor in self.successors(&id) {
                if let Some(degree) = in_degrees.get_mut(successor) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(successor.clone());
                    }
                }
            }
            result.push(id);
        }

        if result.len() != self.nodes.len() {
            return Err(Error::cyclic(
                self.workflow_id.clone(),
                self.unresolved(&in_degrees),
            ));
        }
        Ok(result)
    }

    fn unresolved(&self, in_degrees: &HashMap<String, usize>) -> Vec<String> {
        self.insertion_order
            .iter()
            .filter(|id| in_degrees.get(id.as_str()).copied().unwrap_or(0) > 0)
            .cloned()
            .collect()
    }
}

/// Output of [`Workflow::execution_plan`]: nodes grouped into levels that
/// can run in parallel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    workflow_id: String,
    levels: Vec<Vec<String>>,
}

impl ExecutionPlan {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// Flattened order: level by level.
    pub fn order(&self) -> Vec<&str> {
        self.levels
            .iter()
            .flat_map(|level| level.iter().map(String::as_str))
            .collect()
    }

    /// Number of nodes in the plan.
    pub fn len(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use serde_json::json;

    fn noop(id: &str) -> Node {
        Node::new(id, |_ctx| async { Ok(json!(null)) })
    }

    fn diamond() -> Workflow {
        Workflow::new("diamond", "Diamond")
            .with_node(noop("a"))
            .unwrap()
            .with_node(noop("b").depends_on(["a"]))
            .unwrap()
            .with_node(noop("c").depends_on(["a"]))
            .unwrap()
            .with_node(noop("d").depends_on(["b", "c"]))
            .unwrap()
    }

    #[test]
    fn test_empty_plan() {
        let plan = Workflow::new("empty", "Empty").execution_plan().unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.len(), 0);
    }

    #[test]
    fn test_diamond_levels() {
        let plan = diamond().execution_plan().unwrap();
        assert_eq!(
            plan.levels(),
            &[
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["d".to_string()],
            ]
        );
        assert_eq!(plan.order(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_topological_sort_respects_edges() {
        let graph = diamond().dependency_graph().unwrap();
        let order = graph.topological_sort().unwrap();
        let position = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(position("a") < position("b"));
        assert!(position("a") < position("c"));
        assert!(position("b") < position("d"));
        assert!(position("c") < position("d"));
    }

    #[test]
    fn test_missing_dependency() {
        let workflow = Workflow::new("wf", "wf")
            .with_node(noop("a").depends_on(["ghost"]))
            .unwrap();
        let err = workflow.execution_plan().unwrap_err();
        assert!(matches!(
            err,
            Error::Dependency { ref node, ref dependency } if node == "a" && dependency == "ghost"
        ));
    }

    #[test]
    fn test_cycle_detected() {
        let workflow = Workflow::new("loop", "Loop")
            .with_node(noop("a").depends_on(["b"]))
            .unwrap()
            .with_node(noop("b").depends_on(["a"]))
            .unwrap()
            .with_node(noop("c"))
            .unwrap();

        match workflow.execution_plan().unwrap_err() {
            Error::CyclicDependency {
                workflow,
                unresolved,
            } => {
                assert_eq!(workflow, "loop");
                assert_eq!(unresolved, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
        assert!(workflow.dependency_graph().unwrap().topological_sort().is_err());
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let workflow = Workflow::new("self", "Self")
            .with_node(noop("a").depends_on(["a"]))
            .unwrap();
        assert!(matches!(
            workflow.execution_plan(),
            Err(Error::CyclicDependency { .. })
        ));
    }
}
