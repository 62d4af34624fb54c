use crate::{Digest, Digester, FlowGraph, GraphError, Resources, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Index of a node in its [`FlowGraph`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Binding function of a `K` node.
///
/// Implementations capture their inputs explicitly and feed them to
/// `write_digest`, so two continuations with the same name and inputs are
/// the same unit of work. `apply` is invoked at most once per node, with the
/// resolved dependency values in declaration order, and returns the root of
/// the subgraph that replaces the node.
pub trait Continuation: Send + Sync {
    fn name(&self) -> &str;

    fn write_digest(&self, d: &mut Digester);

    fn apply(&self, values: &[Value], graph: &mut FlowGraph) -> Result<NodeId, GraphError>;
}

/// Per-element body of a `Map` node.
pub trait Mapper: Send + Sync {
    fn name(&self) -> &str;

    fn write_digest(&self, d: &mut Digester);

    fn apply(&self, item: &Value, graph: &mut FlowGraph) -> Result<NodeId, GraphError>;
}

/// Placeholder substitution in an exec command template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecArg {
    /// The resolved value of dependency `i`.
    Dep(usize),
    /// The path of declared output `i`.
    Out(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    File,
    Dir,
}

/// Parameters of an `Exec` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecSpec {
    pub image: String,
    /// Command template; each `%s` is replaced by the next entry of `args`.
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<ExecArg>,
    #[serde(default = "default_outputs")]
    pub outputs: Vec<OutputKind>,
    #[serde(default)]
    pub resources: Resources,
}

fn default_outputs() -> Vec<OutputKind> {
    vec![OutputKind::File]
}

impl ExecSpec {
    pub fn new(image: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            cmd: cmd.into(),
            args: Vec::new(),
            outputs: default_outputs(),
            resources: Resources::ZERO,
        }
    }

    pub fn with_args(mut self, args: Vec<ExecArg>) -> Self {
        self.args = args;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<OutputKind>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    fn validate(&self, ndeps: usize) -> Result<(), GraphError> {
        let placeholders = self.cmd.matches("%s").count();
        if placeholders != self.args.len() {
            return Err(GraphError::invalid_node(
                "exec",
                format!(
                    "command has {} placeholder(s) but {} argument(s)",
                    placeholders,
                    self.args.len()
                ),
            ));
        }
        for arg in &self.args {
            match *arg {
                ExecArg::Dep(i) if i >= ndeps => {
                    return Err(GraphError::invalid_node(
                        "exec",
                        format!("argument refers to dependency {} of {}", i, ndeps),
                    ));
                }
                ExecArg::Out(i) if i >= self.outputs.len() => {
                    return Err(GraphError::invalid_node(
                        "exec",
                        format!("argument refers to output {} of {}", i, self.outputs.len()),
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Pure, type-level transformations of an already computed value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coercion {
    /// Tuple element `i`.
    Field(usize),
    /// Struct member by name.
    Member(String),
    /// A directory holding exactly one file, as that file.
    File,
    /// A directory as the list of its files in path order.
    Files,
    /// A file as a single-entry directory.
    Dir(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    List,
    Tuple,
}

/// Operation performed by a flow node.
#[derive(Clone)]
pub enum Op {
    Val(Value),
    Intern { url: String },
    Extern { url: String },
    Exec(ExecSpec),
    Coerce(Coercion),
    K(Arc<dyn Continuation>),
    Map(Arc<dyn Mapper>),
    Collect { pattern: String, replacement: String },
    GroupBy { pattern: String },
    Join(JoinKind),
    Merge,
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Val(_) => "val",
            Op::Intern { .. } => "intern",
            Op::Extern { .. } => "extern",
            Op::Exec(_) => "exec",
            Op::Coerce(_) => "coerce",
            Op::K(_) => "k",
            Op::Map(_) => "map",
            Op::Collect { .. } => "collect",
            Op::GroupBy { .. } => "groupby",
            Op::Join(_) => "join",
            Op::Merge => "merge",
        }
    }

    /// Ops that must be sent to an executor.
    pub fn is_dispatched(&self) -> bool {
        matches!(self, Op::Intern { .. } | Op::Extern { .. } | Op::Exec(_))
    }

    /// Ops whose results are memoized in the result cache.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Op::Intern { .. } | Op::Exec(_))
    }

    /// Ops whose dependency order does not affect the result.
    pub fn is_commutative(&self) -> bool {
        matches!(self, Op::Merge)
    }

    pub fn resources(&self) -> Resources {
        match self {
            Op::Exec(spec) => spec.resources,
            _ => Resources::ZERO,
        }
    }

    pub(crate) fn validate(&self, ndeps: usize) -> Result<(), GraphError> {
        let arity = |ok: bool, want: &str| {
            if ok {
                Ok(())
            } else {
                Err(GraphError::invalid_node(
                    self.name(),
                    format!("expected {} dependencies, got {}", want, ndeps),
                ))
            }
        };
        match self {
            Op::Val(_) | Op::Intern { .. } => arity(ndeps == 0, "0"),
            Op::Extern { .. } | Op::Coerce(_) | Op::Map(_) => arity(ndeps == 1, "1"),
            Op::K(_) | Op::Merge => arity(ndeps >= 1, "at least 1"),
            Op::Join(_) => Ok(()),
            Op::Exec(spec) => spec.validate(ndeps),
            Op::Collect { pattern, .. } | Op::GroupBy { pattern } => {
                arity(ndeps == 1, "1")?;
                let re = regex::Regex::new(pattern)
                    .map_err(|e| GraphError::invalid_node(self.name(), e.to_string()))?;
                if matches!(self, Op::GroupBy { .. }) && re.captures_len() < 2 {
                    return Err(GraphError::invalid_node(
                        self.name(),
                        "pattern needs a capture group",
                    ));
                }
                Ok(())
            }
        }
    }

    fn write_params(&self, d: &mut Digester) {
        match self {
            Op::Val(v) => v.write_digest(d),
            Op::Intern { url } | Op::Extern { url } => {
                d.write_str(url);
            }
            Op::Exec(spec) => {
                d.write_str(&spec.image).write_str(&spec.cmd);
                d.write_u64(spec.args.len() as u64);
                for arg in &spec.args {
                    match arg {
                        ExecArg::Dep(i) => d.write_tag("dep").write_u64(*i as u64),
                        ExecArg::Out(i) => d.write_tag("out").write_u64(*i as u64),
                    };
                }
                d.write_u64(spec.outputs.len() as u64);
                for out in &spec.outputs {
                    d.write_tag(match out {
                        OutputKind::File => "file",
                        OutputKind::Dir => "dir",
                    });
                }
                d.write_u64(spec.resources.cpu)
                    .write_u64(spec.resources.memory)
                    .write_u64(spec.resources.disk);
            }
            Op::Coerce(c) => {
                match c {
                    Coercion::Field(i) => d.write_tag("field").write_u64(*i as u64),
                    Coercion::Member(name) => d.write_tag("member").write_str(name),
                    Coercion::File => d.write_tag("file"),
                    Coercion::Files => d.write_tag("files"),
                    Coercion::Dir(name) => d.write_tag("dir").write_str(name),
                };
            }
            Op::K(k) => {
                d.write_str(k.name());
                k.write_digest(d);
            }
            Op::Map(m) => {
                d.write_str(m.name());
                m.write_digest(d);
            }
            Op::Collect {
                pattern,
                replacement,
            } => {
                d.write_str(pattern).write_str(replacement);
            }
            Op::GroupBy { pattern } => {
                d.write_str(pattern);
            }
            Op::Join(kind) => {
                d.write_tag(match kind {
                    JoinKind::List => "list",
                    JoinKind::Tuple => "tuple",
                });
            }
            Op::Merge => {}
        }
    }

    /// Digest of this op applied to dependencies with the given digests.
    pub fn digest(&self, deps: &[Digest]) -> Digest {
        let mut d = Digester::new();
        d.write_tag(self.name());
        self.write_params(&mut d);
        d.write_u64(deps.len() as u64);
        if self.is_commutative() {
            let mut sorted = deps.to_vec();
            sorted.sort();
            for dep in &sorted {
                d.write_digest(dep);
            }
        } else {
            for dep in deps {
                d.write_digest(dep);
            }
        }
        d.finish()
    }
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Val(v) => f.debug_tuple("Val").field(v).finish(),
            Op::Intern { url } => f.debug_struct("Intern").field("url", url).finish(),
            Op::Extern { url } => f.debug_struct("Extern").field("url", url).finish(),
            Op::Exec(spec) => f.debug_tuple("Exec").field(spec).finish(),
            Op::Coerce(c) => f.debug_tuple("Coerce").field(c).finish(),
            Op::K(k) => write!(f, "K({})", k.name()),
            Op::Map(m) => write!(f, "Map({})", m.name()),
            Op::Collect {
                pattern,
                replacement,
            } => f
                .debug_struct("Collect")
                .field("pattern", pattern)
                .field("replacement", replacement)
                .finish(),
            Op::GroupBy { pattern } => f.debug_struct("GroupBy").field("pattern", pattern).finish(),
            Op::Join(kind) => f.debug_tuple("Join").field(kind).finish(),
            Op::Merge => f.write_str("Merge"),
        }
    }
}

/// A node of the flow graph. Immutable once it enters the arena.
#[derive(Debug, Clone)]
pub struct FlowNode {
    pub(crate) op: Op,
    pub(crate) deps: Vec<NodeId>,
    pub(crate) digest: Digest,
}

impl FlowNode {
    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn deps(&self) -> &[NodeId] {
        &self.deps
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn resources(&self) -> Resources {
        self.op.resources()
    }
}

/// Evaluation state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Init,
    Running,
    Done,
    Error,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Done | NodeState::Error)
    }
}

/// Point-in-time view of one node, for observability tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub digest: Digest,
    pub op: String,
    pub state: NodeState,
    /// Executor currently (or last) assigned to this node.
    pub executor: Option<String>,
    pub error: Option<String>,
}
