//! Core abstractions for the flow engine
//!
//! This crate provides the data model shared by every other component:
//! content digests, resources, values, the flow graph and its nodes, the
//! serialized graph format, and the executor and repository interfaces the
//! evaluator consumes. It does not run anything itself.

mod digest;
mod error;
mod events;
mod executor;
mod graph;
mod node;
mod repository;
mod resources;
mod spec;
mod value;

pub use digest::{Digest, Digester, ParseDigestError};
pub use error::{EvalError, ExecutorError, FlowError, GraphError, RepositoryError};
pub use events::{EventBus, EventEmitter, ExecutionEvent, ExecutionId};
pub use executor::{Exec, ExecConfig, ExecResult, Executor, ResolvedArg};
pub use graph::FlowGraph;
pub use node::{
    Coercion, Continuation, ExecArg, ExecSpec, FlowNode, JoinKind, Mapper, NodeId, NodeState,
    NodeStatus, Op, OutputKind,
};
pub use repository::{transfer, Assoc, Repository};
pub use resources::{Resources, GIB, KIB, MIB, TIB};
pub use spec::{GraphSpec, NodeSpec, OpSpec};
pub use value::{FileRef, Value};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
