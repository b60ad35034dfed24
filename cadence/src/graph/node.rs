//! Node - a single unit of work inside a workflow.

use crate::core::{BoxError, BoxFuture, Result, RetryPolicy};
use crate::executor::NodeContext;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// What a node handler resolves to.
pub type NodeOutput = std::result::Result<Value, BoxError>;

/// Type-erased node handler.
pub type NodeHandler = Arc<dyn Fn(NodeContext) -> BoxFuture<NodeOutput> + Send + Sync>;

/// A node in a workflow: an id, a handler and the ids of the nodes it
/// depends on.
///
/// Cloning a node is cheap; the handler is reference counted.
///
/// # Example
///
/// ```
/// use cadence::{Node, RetryPolicy};
/// use serde_json::json;
///
/// let node = Node::new("fetch", |_ctx| async move { Ok(json!({"rows": 3})) })
///     .with_name("Fetch rows")
///     .with_retry(RetryPolicy::with_max_attempts(3))
///     .unwrap()
///     .depends_on(["connect"]);
///
/// assert_eq!(node.dependencies(), ["connect".to_string()]);
/// ```
#[derive(Clone)]
pub struct Node {
    id: String,
    name: Option<String>,
    handler: NodeHandler,
    retry: RetryPolicy,
    depends_on: Vec<String>,
}

impl Node {
    /// Creates a node with no dependencies and the default (single attempt)
    /// retry policy.
    pub fn new<F, Fut>(id: impl Into<String>, handler: F) -> Self
    where
        F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = NodeOutput> + Send + 'static,
    {
        Self {
            id: id.into(),
            name: None,
            handler: Arc::new(move |ctx| Box::pin(handler(ctx))),
            retry: RetryPolicy::default(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the retry policy, rejecting invalid ones.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Result<Self> {
        policy.validate()?;
        self.retry = policy;
        Ok(self)
    }

    /// Adds dependencies. Duplicates are ignored.
    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for dependency in dependencies {
            self.add_dependency(dependency);
        }
        self
    }

    /// Adds a single dependency edge. Returns false if it was already present.
    pub fn add_dependency(&mut self, dependency: impl Into<String>) -> bool {
        let dependency = dependency.into();
        if self.depends_on.contains(&dependency) {
            return false;
        }
        self.depends_on.push(dependency);
        true
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Ids of the nodes that must complete before this one starts.
    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }

    pub(crate) fn handler(&self) -> NodeHandler {
        Arc::clone(&self.handler)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("retry", &self.retry)
            .field("depends_on", &self.depends_on)
            .finish_non_exhaustive()
    }
}
