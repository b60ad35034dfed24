//! Workflow definitions and dependency planning.
//!
//! - [`Workflow`] / [`Node`]: declarative DAG definition with a retry policy
//!   per node
//! - [`DependencyGraph`]: bidirectional adjacency lists built from the
//!   nodes' `depends_on` edges
//! - [`ExecutionPlan`]: Kahn levels, the recommended pre-flight check
//!
//! # Algorithm References
//!
//! Kahn's algorithm for topological sort, with insertion order as the
//! tie-breaker among equally-ready nodes.

mod node;
mod plan;
mod workflow;

pub use node::{Node, NodeHandler, NodeOutput};
pub use plan::{DependencyGraph, ExecutionPlan};
pub use workflow::{Workflow, WorkflowType};
