//! Workflow - a named collection of nodes forming a DAG.

use super::node::Node;
use super::plan::{DependencyGraph, ExecutionPlan};
use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Workflow flavor.
///
/// A chatflow requires a conversation id on every run and carries mutable
/// memory across runs of the same conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    #[default]
    Workflow,
    Chatflow,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::Workflow => "workflow",
            WorkflowType::Chatflow => "chatflow",
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A workflow definition.
///
/// Nodes keep their insertion order, which is also the order in which
/// equally-ready nodes are scheduled.
///
/// # Example
///
/// ```
/// use cadence::{Node, Workflow};
/// use serde_json::json;
///
/// let mut workflow = Workflow::new("orders", "Order pipeline");
/// workflow.add_node(Node::new("load", |_| async { Ok(json!(1)) })).unwrap();
/// workflow.add_node(Node::new("save", |_| async { Ok(json!(2)) })).unwrap();
/// workflow.connect("load", "save").unwrap();
///
/// let plan = workflow.execution_plan().unwrap();
/// assert_eq!(plan.levels(), &[vec!["load".to_string()], vec!["save".to_string()]]);
/// ```
#[derive(Debug, Clone)]
pub struct Workflow {
    id: String,
    name: String,
    kind: WorkflowType,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: WorkflowType::Workflow,
            nodes: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Creates a chatflow workflow.
    pub fn chatflow(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name).with_type(WorkflowType::Chatflow)
    }

    pub fn with_type(mut self, kind: WorkflowType) -> Self {
        self.kind = kind;
        self
    }

    /// Adds a node.
    ///
    /// Returns `Conflict` if a node with the same id already exists.
    /// Dependencies are not checked here; see [`Workflow::execution_plan`].
    pub fn add_node(&mut self, node: Node) -> Result<()> {
        if self.index.contains_key(node.id()) {
            return Err(Error::conflict(format!(
                "node '{}' already exists in workflow '{}'",
                node.id(),
                self.id
            )));
        }
        self.index.insert(node.id().to_string(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    /// Chaining form of [`Workflow::add_node`].
    pub fn with_node(mut self, node: Node) -> Result<Self> {
        self.add_node(node)?;
        Ok(self)
    }

    /// Declares that `to` depends on `from`.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<()> {
        if !self.index.contains_key(from) {
            return Err(Error::not_found(format!(
                "node '{}' in workflow '{}'",
                from, self.id
            )));
        }
        let position = *self
            .index
            .get(to)
            .ok_or_else(|| Error::not_found(format!("node '{}' in workflow '{}'", to, self.id)))?;
        self.nodes[position].add_dependency(from);
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> WorkflowType {
        self.kind
    }

    pub fn is_chatflow(&self) -> bool {
        self.kind == WorkflowType::Chatflow
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&position| &self.nodes[position])
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Builds the dependency graph, failing on missing dependencies.
    pub fn dependency_graph(&self) -> Result<DependencyGraph> {
        DependencyGraph::from_workflow(self)
    }

    /// Computes the topological execution plan.
    ///
    /// Fails with `Dependency` for a missing dependency and with
    /// `CyclicDependency` if some nodes can never become ready.
    pub fn execution_plan(&self) -> Result<ExecutionPlan> {
        self.dependency_graph()?.plan()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop(id: &str) -> Node {
        Node::new(id, |_ctx| async { Ok(json!(null)) })
    }

    #[test]
    fn test_duplicate_node_conflict() {
        let mut workflow = Workflow::new("wf", "wf");
        workflow.add_node(noop("a")).unwrap();
        let err = workflow.add_node(noop("a")).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(workflow.len(), 1);
    }

    #[test]
    fn test_connect_unknown_node() {
        let mut workflow = Workflow::new("wf", "wf").with_node(noop("a")).unwrap();
        assert!(matches!(
            workflow.connect("a", "missing"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            workflow.connect("missing", "a"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_connect_adds_edge() {
        let mut workflow = Workflow::new("wf", "wf")
            .with_node(noop("a"))
            .unwrap()
            .with_node(noop("b"))
            .unwrap();
        workflow.connect("a", "b").unwrap();
        workflow.connect("a", "b").unwrap();
        assert_eq!(workflow.node("b").unwrap().dependencies(), ["a".to_string()]);
    }

    #[test]
    fn test_chatflow_type() {
        let workflow = Workflow::chatflow("chat", "Chat");
        assert!(workflow.is_chatflow());
        assert_eq!(workflow.kind().to_string(), "chatflow");
    }
}
