//! Building flow graphs from graph files.

use crate::registry::ContinuationRegistry;
use flowcore::{
    ExecSpec, FlowError, FlowGraph, GraphError, GraphSpec, JoinKind, NodeId, Op, OpSpec,
};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::path::Path;

/// Turns [`GraphSpec`]s into [`FlowGraph`]s, resolving continuations by name.
pub struct GraphLoader<'a> {
    registry: &'a ContinuationRegistry,
}

impl<'a> GraphLoader<'a> {
    pub fn new(registry: &'a ContinuationRegistry) -> Self {
        Self { registry }
    }

    /// Read and parse a graph file.
    pub fn read(path: impl AsRef<Path>) -> Result<GraphSpec, FlowError> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    /// Build the graph, returning it with the id of its root.
    pub fn load(&self, spec: &GraphSpec) -> Result<(FlowGraph, NodeId), GraphError> {
        let order = self.order(spec)?;
        let mut graph = FlowGraph::new();
        let mut ids: HashMap<&str, NodeId> = HashMap::new();
        for index in order {
            let node = &spec.nodes[index];
            let deps = node
                .deps
                .iter()
                .map(|d| ids.get(d.as_str()).copied().ok_or_else(|| GraphError::NodeNotFound(d.clone())))
                .collect::<Result<Vec<_>, _>>()?;
            let op = self.op(&node.op)?;
            let id = graph.add(op, deps)?;
            tracing::debug!("Loaded node {} as {}", node.id, id);
            ids.insert(node.id.as_str(), id);
        }
        let root = ids
            .get(spec.root.as_str())
            .copied()
            .ok_or_else(|| GraphError::NodeNotFound(spec.root.clone()))?;
        Ok((graph, root))
    }

    /// Indices of `spec.nodes`, dependencies first.
    fn order(&self, spec: &GraphSpec) -> Result<Vec<usize>, GraphError> {
        let mut dag: DiGraph<usize, ()> = DiGraph::new();
        let mut index: HashMap<&str, NodeIndex> = HashMap::new();
        for (i, node) in spec.nodes.iter().enumerate() {
            if index.insert(node.id.as_str(), dag.add_node(i)).is_some() {
                return Err(GraphError::Invalid(format!("duplicate node id {:?}", node.id)));
            }
        }
        for node in &spec.nodes {
            let to = index[node.id.as_str()];
            for dep in &node.deps {
                let from = index
                    .get(dep.as_str())
                    .ok_or_else(|| GraphError::NodeNotFound(dep.clone()))?;
                dag.add_edge(*from, to, ());
            }
        }
        let sorted = toposort(&dag, None).map_err(|_| GraphError::CyclicDependency)?;
        Ok(sorted.into_iter().map(|idx| dag[idx]).collect())
    }

    fn op(&self, spec: &OpSpec) -> Result<Op, GraphError> {
        Ok(match spec {
            OpSpec::Val { value } => Op::Val(value.clone()),
            OpSpec::Intern { url } => Op::Intern { url: url.clone() },
            OpSpec::Extern { url } => Op::Extern { url: url.clone() },
            OpSpec::Exec {
                image,
                cmd,
                args,
                outputs,
                resources,
            } => Op::Exec(
                ExecSpec::new(image.clone(), cmd.clone())
                    .with_args(args.clone())
                    .with_outputs(outputs.clone())
                    .with_resources(*resources),
            ),
            OpSpec::Coerce { coercion } => Op::Coerce(coercion.clone()),
            OpSpec::Collect {
                pattern,
                replacement,
            } => Op::Collect {
                pattern: pattern.clone(),
                replacement: replacement.clone(),
            },
            OpSpec::GroupBy { pattern } => Op::GroupBy {
                pattern: pattern.clone(),
            },
            OpSpec::List => Op::Join(JoinKind::List),
            OpSpec::Tuple => Op::Join(JoinKind::Tuple),
            OpSpec::Merge => Op::Merge,
            OpSpec::K {
                continuation,
                params,
            } => Op::K(self.registry.continuation(continuation, params)?),
            OpSpec::Map { mapper, params } => Op::Map(self.registry.mapper(mapper, params)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore::NodeSpec;

    fn parse(json: &str) -> GraphSpec {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_load_builds_deduplicated_graph() {
        let spec = parse(
            r#"{
                "root": "both",
                "nodes": [
                    {"id": "in", "op": "intern", "url": "file:///tmp/x"},
                    {"id": "a", "op": "exec", "image": "ubuntu", "cmd": "wc -l %s > %s",
                     "args": [{"dep": 0}, {"out": 0}], "deps": ["in"]},
                    {"id": "b", "op": "exec", "image": "ubuntu", "cmd": "wc -l %s > %s",
                     "args": [{"dep": 0}, {"out": 0}], "deps": ["in"]},
                    {"id": "both", "op": "list", "deps": ["a", "b"]}
                ]
            }"#,
        );
        let registry = ContinuationRegistry::new();
        let (graph, root) = GraphLoader::new(&registry).load(&spec).unwrap();
        // "a" and "b" are the same node.
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.node(root).deps()[0], graph.node(root).deps()[1]);
    }

    #[test]
    fn test_load_rejects_cycles() {
        let mut spec = GraphSpec::new("cycle", "a");
        spec.add_node(NodeSpec::new("a", OpSpec::List).with_dep("b"));
        spec.add_node(NodeSpec::new("b", OpSpec::List).with_dep("a"));
        let registry = ContinuationRegistry::new();
        assert_eq!(
            GraphLoader::new(&registry).load(&spec).unwrap_err(),
            GraphError::CyclicDependency
        );
    }

    #[test]
    fn test_load_rejects_unknown_references() {
        let registry = ContinuationRegistry::new();
        let loader = GraphLoader::new(&registry);

        let mut dangling = GraphSpec::new("dangling", "a");
        dangling.add_node(NodeSpec::new("a", OpSpec::List).with_dep("nope"));
        assert_eq!(
            loader.load(&dangling).unwrap_err(),
            GraphError::NodeNotFound("nope".to_string())
        );

        let mut unknown = GraphSpec::new("unknown", "k");
        unknown.add_node(NodeSpec::new(
            "k",
            OpSpec::K {
                continuation: "nope".to_string(),
                params: flowcore::Value::Unit,
            },
        ));
        assert!(matches!(loader.load(&unknown), Err(GraphError::UnknownContinuation(_))));
    }
}
