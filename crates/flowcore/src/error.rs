use crate::{Digest, Resources};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Evaluation error: {0}")]
    Eval(#[from] EvalError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Malformed graphs. These are fatal and surface before anything runs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Cyclic dependency detected")]
    CyclicDependency,

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid {op} node: {reason}")]
    InvalidNode { op: String, reason: String },

    #[error("Unknown continuation: {0}")]
    UnknownContinuation(String),

    #[error("Invalid graph: {0}")]
    Invalid(String),
}

impl GraphError {
    pub fn invalid_node(op: &str, reason: impl Into<String>) -> Self {
        GraphError::InvalidNode {
            op: op.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("Object not found: {0}")]
    NotFound(Digest),

    #[error("Repository unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt object: expected {expected}, got {actual}")]
    Corrupt { expected: Digest, actual: Digest },

    #[error("IO error: {0}")]
    Io(String),
}

impl RepositoryError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Unavailable(_))
    }
}

impl From<std::io::Error> for RepositoryError {
    fn from(e: std::io::Error) -> Self {
        RepositoryError::Io(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutorError {
    #[error("Executor unavailable: {0}")]
    Unavailable(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Exec not found: {0}")]
    NotFound(Digest),

    #[error("Invalid exec: {0}")]
    Invalid(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Executor overcommitted: requested {requested}, available {available}")]
    Overcommitted {
        requested: Resources,
        available: Resources,
    },

    #[error("IO error: {0}")]
    Io(String),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Cancelled")]
    Cancelled,
}

impl ExecutorError {
    /// Infrastructure failures that may succeed when resubmitted.
    pub fn is_transient(&self) -> bool {
        match self {
            ExecutorError::Unavailable(_) | ExecutorError::Network(_) => true,
            ExecutorError::Repository(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for ExecutorError {
    fn from(e: std::io::Error) -> Self {
        ExecutorError::Io(e.to_string())
    }
}

/// Terminal cause of a node failure. Cloned to every dependent and waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("exec {} failed with exit code {exit_code}: {message}", .digest.short())]
    Work {
        digest: Digest,
        exit_code: i32,
        message: String,
    },

    #[error("exec {} failed after {attempts} attempt(s): {message}", .digest.short())]
    Executor {
        digest: Digest,
        attempts: u32,
        message: String,
    },

    #[error("node {} requires {required}, which exceeds every executor (largest {largest})", .digest.short())]
    Resources {
        digest: Digest,
        required: Resources,
        largest: Resources,
    },

    #[error("type error in node {}: {message}", .digest.short())]
    Type { digest: Digest, message: String },

    #[error("{0}")]
    Graph(#[from] GraphError),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl EvalError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EvalError::Cancelled(_))
    }

    pub fn type_error(digest: Digest, message: impl Into<String>) -> Self {
        EvalError::Type {
            digest,
            message: message.into(),
        }
    }
}
