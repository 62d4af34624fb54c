use crate::{
    Coercion, Continuation, Digest, ExecSpec, FlowNode, GraphError, JoinKind, Mapper, NodeId, Op,
    Value,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Arena of flow nodes with structural interning.
///
/// A node may only depend on nodes already in the arena, so every graph
/// built through this API is acyclic. Adding a node whose digest is already
/// present returns the existing id instead of a copy.
#[derive(Debug, Default, Clone)]
pub struct FlowGraph {
    nodes: Vec<FlowNode>,
    interned: HashMap<Digest, NodeId>,
}

impl FlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&FlowNode> {
        self.nodes.get(id.index())
    }

    /// Panics if `id` was not produced by this graph.
    pub fn node(&self, id: NodeId) -> &FlowNode {
        &self.nodes[id.index()]
    }

    pub fn digest(&self, id: NodeId) -> Digest {
        self.node(id).digest
    }

    /// Canonical node for `digest`, if one has been built.
    pub fn lookup(&self, digest: &Digest) -> Option<NodeId> {
        self.interned.get(digest).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    /// Add a node, validating its arity and parameters.
    pub fn add(&mut self, op: Op, deps: Vec<NodeId>) -> Result<NodeId, GraphError> {
        for dep in &deps {
            if self.get(*dep).is_none() {
                return Err(GraphError::NodeNotFound(dep.to_string()));
            }
        }
        op.validate(deps.len())?;
        Ok(self.insert(op, deps))
    }

    fn insert(&mut self, op: Op, deps: Vec<NodeId>) -> NodeId {
        let dep_digests: Vec<Digest> = deps.iter().map(|d| self.digest(*d)).collect();
        let digest = op.digest(&dep_digests);
        if let Some(existing) = self.interned.get(&digest) {
            return *existing;
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(FlowNode { op, deps, digest });
        self.interned.insert(digest, id);
        id
    }

    pub fn val(&mut self, value: impl Into<Value>) -> NodeId {
        self.insert(Op::Val(value.into()), Vec::new())
    }

    pub fn intern(&mut self, url: impl Into<String>) -> NodeId {
        self.insert(Op::Intern { url: url.into() }, Vec::new())
    }

    pub fn extern_(&mut self, url: impl Into<String>, dep: NodeId) -> Result<NodeId, GraphError> {
        self.add(Op::Extern { url: url.into() }, vec![dep])
    }

    pub fn exec(&mut self, spec: ExecSpec, deps: Vec<NodeId>) -> Result<NodeId, GraphError> {
        self.add(Op::Exec(spec), deps)
    }

    pub fn coerce(&mut self, coercion: Coercion, dep: NodeId) -> Result<NodeId, GraphError> {
        self.add(Op::Coerce(coercion), vec![dep])
    }

    pub fn k(
        &mut self,
        deps: Vec<NodeId>,
        continuation: Arc<dyn Continuation>,
    ) -> Result<NodeId, GraphError> {
        self.add(Op::K(continuation), deps)
    }

    pub fn map(&mut self, dep: NodeId, mapper: Arc<dyn Mapper>) -> Result<NodeId, GraphError> {
        self.add(Op::Map(mapper), vec![dep])
    }

    pub fn collect(
        &mut self,
        dep: NodeId,
        pattern: impl Into<String>,
        replacement: impl Into<String>,
    ) -> Result<NodeId, GraphError> {
        self.add(
            Op::Collect {
                pattern: pattern.into(),
                replacement: replacement.into(),
            },
            vec![dep],
        )
    }

    pub fn group_by(&mut self, dep: NodeId, pattern: impl Into<String>) -> Result<NodeId, GraphError> {
        self.add(
            Op::GroupBy {
                pattern: pattern.into(),
            },
            vec![dep],
        )
    }

    pub fn list(&mut self, deps: Vec<NodeId>) -> Result<NodeId, GraphError> {
        self.add(Op::Join(JoinKind::List), deps)
    }

    pub fn tuple(&mut self, deps: Vec<NodeId>) -> Result<NodeId, GraphError> {
        self.add(Op::Join(JoinKind::Tuple), deps)
    }

    pub fn merge(&mut self, deps: Vec<NodeId>) -> Result<NodeId, GraphError> {
        self.add(Op::Merge, deps)
    }

    /// Nodes reachable from `root`, dependencies before dependents.
    pub fn reachable(&self, root: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        // Iterative post-order; graphs produced by fan-out can be deep.
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if !seen.insert(id) {
                continue;
            }
            stack.push((id, true));
            for dep in self.node(id).deps.iter().rev() {
                if !seen.contains(dep) {
                    stack.push((*dep, false));
                }
            }
        }
        order
    }

    /// Whether `target` is `from` or one of its transitive dependencies.
    pub fn depends_on(&self, from: NodeId, target: NodeId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if seen.insert(id) {
                stack.extend(self.node(id).deps.iter().copied());
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExecArg, Resources, GIB};

    fn cat_exec(g: &mut FlowGraph, url: &str) -> NodeId {
        let input = g.intern(url);
        let spec = ExecSpec::new("ubuntu", "cat %s > %s")
            .with_args(vec![ExecArg::Dep(0), ExecArg::Out(0)])
            .with_resources(Resources::new(32, 32 * GIB, 0));
        g.exec(spec, vec![input]).unwrap()
    }

    #[test]
    fn test_identical_subgraphs_share_digest() {
        let mut a = FlowGraph::new();
        let mut b = FlowGraph::new();
        b.val(99);
        let na = cat_exec(&mut a, "s3://blah");
        let nb = cat_exec(&mut b, "s3://blah");
        assert_eq!(a.digest(na), b.digest(nb));
        assert_ne!(na, nb);
    }

    #[test]
    fn test_parameters_change_digest() {
        let mut g = FlowGraph::new();
        let x = cat_exec(&mut g, "s3://blah");
        let y = cat_exec(&mut g, "s3://other");
        assert_ne!(g.digest(x), g.digest(y));

        let one = g.val(1);
        let two = g.val(2);
        let l1 = g.list(vec![one, two]).unwrap();
        let l2 = g.list(vec![two, one]).unwrap();
        assert_ne!(g.digest(l1), g.digest(l2));
        let t = g.tuple(vec![one, two]).unwrap();
        assert_ne!(g.digest(l1), g.digest(t));
    }

    #[test]
    fn test_merge_digest_is_order_insensitive() {
        let mut g = FlowGraph::new();
        let a = g.intern("file:///a");
        let b = g.intern("file:///b");
        let m1 = g.merge(vec![a, b]).unwrap();
        let m2 = g.merge(vec![b, a]).unwrap();
        assert_eq!(m1, m2);
    }

    #[test]
    fn test_interning_deduplicates_nodes() {
        let mut g = FlowGraph::new();
        let x = cat_exec(&mut g, "s3://blah");
        let before = g.len();
        let y = cat_exec(&mut g, "s3://blah");
        assert_eq!(x, y);
        assert_eq!(g.len(), before);
        assert_eq!(g.lookup(&g.digest(x)), Some(x));
    }

    #[test]
    fn test_construction_validation() {
        let mut g = FlowGraph::new();
        let input = g.intern("s3://blah");
        let bad_arg = ExecSpec::new("ubuntu", "cat %s").with_args(vec![ExecArg::Dep(1)]);
        assert!(matches!(
            g.exec(bad_arg, vec![input]),
            Err(GraphError::InvalidNode { .. })
        ));
        let bad_count = ExecSpec::new("ubuntu", "cat %s %s").with_args(vec![ExecArg::Dep(0)]);
        assert!(g.exec(bad_count, vec![input]).is_err());
        assert!(g.coerce(Coercion::File, NodeId(42)).is_err());
        assert!(g.group_by(input, "no-group").is_err());
        assert!(g.collect(input, "(", "").is_err());
        assert!(g.merge(vec![]).is_err());
    }

    #[test]
    fn test_reachable_is_dependency_first() {
        let mut g = FlowGraph::new();
        let unrelated = g.val("unused");
        let root = cat_exec(&mut g, "s3://blah");
        let order = g.reachable(root);
        assert_eq!(order.len(), 2);
        assert_eq!(*order.last().unwrap(), root);
        assert!(!order.contains(&unrelated));
        assert!(g.depends_on(root, order[0]));
        assert!(!g.depends_on(order[0], root));
    }
}
