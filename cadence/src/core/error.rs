use std::sync::Arc;
use thiserror::Error;

/// Boxed error returned by user-supplied handlers (nodes, subscribers, cron jobs).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Reference-counted error kept in run results so they stay `Clone`.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Error type shared by every component of the cadence engine.
///
/// The variants are error *kinds*: callers match on them to decide whether a
/// failure is their fault (`InvalidArgument`), a lookup miss (`NotFound`), a
/// registry clash (`Conflict`) and so on. Node handler failures never surface
/// through this type directly; they are collected in the run result instead.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Malformed input: a bad cron field, a missing conversation id, an
    /// invalid retry policy.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown workflow, node or job id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate registration.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Operation is not valid in the current mode or configuration.
    #[error("invalid state: {0}")]
    State(String),

    /// A node declares a dependency on a node that does not exist.
    #[error("dependency '{dependency}' for node '{node}' does not exist")]
    Dependency {
        /// The node that declared the dependency
        node: String,
        /// The missing dependency
        dependency: String,
    },

    /// The dependency graph of a workflow contains a cycle.
    #[error(
        "cycle detected in workflow '{workflow}': unresolved nodes [{}]",
        unresolved.join(", ")
    )]
    CyclicDependency {
        /// Workflow id
        workflow: String,
        /// Nodes that could never become ready
        unresolved: Vec<String>,
    },

    /// Generic wrapped failure, including persistence failures.
    #[error("{message}")]
    Runtime {
        message: String,
        #[source]
        source: Option<SharedError>,
    },

    /// Work was aborted through a cancellation token. Never retried.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }

    pub fn dependency(node: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self::Dependency {
            node: node.into(),
            dependency: dependency.into(),
        }
    }

    pub fn cyclic(workflow: impl Into<String>, unresolved: Vec<String>) -> Self {
        Self::CyclicDependency {
            workflow: workflow.into(),
            unresolved,
        }
    }

    /// Creates a runtime error without an underlying cause.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a runtime error wrapping `source`.
    pub fn runtime_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Runtime {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled(message.into())
    }

    /// Returns true for the cancellation kind.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Stable name of the error kind, used when errors are serialized into
    /// run records.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "InvalidArgumentError",
            Self::NotFound(_) => "NotFoundError",
            Self::Conflict(_) => "ConflictError",
            Self::State(_) => "StateError",
            Self::Dependency { .. } => "DependencyError",
            Self::CyclicDependency { .. } => "CyclicDependencyError",
            Self::Runtime { .. } => "RuntimeError",
            Self::Cancelled(_) => "CancellationError",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
