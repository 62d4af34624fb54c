use crate::{Coercion, ExecArg, OutputKind, Resources, Value};
use serde::{Deserialize, Serialize};

/// Serialized flow graph, as produced by a front end and read by the loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Id of the node whose value is the result of the graph.
    pub root: String,
    pub nodes: Vec<NodeSpec>,
}

impl GraphSpec {
    pub fn new(name: impl Into<String>, root: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            description: None,
            root: root.into(),
            nodes: Vec::new(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> &mut Self {
        self.nodes.push(node);
        self
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Node in a graph file. Dependencies refer to other nodes by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(flatten)]
    pub op: OpSpec,
    #[serde(default)]
    pub deps: Vec<String>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, op: OpSpec) -> Self {
        Self {
            id: id.into(),
            op,
            deps: Vec::new(),
        }
    }

    pub fn with_dep(mut self, dep: impl Into<String>) -> Self {
        self.deps.push(dep.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpSpec {
    Val {
        value: Value,
    },
    Intern {
        url: String,
    },
    Extern {
        url: String,
    },
    Exec {
        image: String,
        cmd: String,
        #[serde(default)]
        args: Vec<ExecArg>,
        #[serde(default = "default_outputs")]
        outputs: Vec<OutputKind>,
        #[serde(default)]
        resources: Resources,
    },
    Coerce {
        coercion: Coercion,
    },
    Collect {
        pattern: String,
        #[serde(default)]
        replacement: String,
    },
    GroupBy {
        pattern: String,
    },
    List,
    Tuple,
    Merge,
    /// Continuation looked up by name in the registry.
    K {
        continuation: String,
        #[serde(default = "unit")]
        params: Value,
    },
    /// Mapper looked up by name in the registry.
    Map {
        mapper: String,
        #[serde(default = "unit")]
        params: Value,
    },
}

fn default_outputs() -> Vec<OutputKind> {
    vec![OutputKind::File]
}

fn unit() -> Value {
    Value::Unit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_graph_file() {
        let json = r#"{
            "name": "example",
            "root": "out",
            "nodes": [
                {"id": "in", "op": "intern", "url": "s3://blah"},
                {"id": "out", "op": "exec", "image": "ubuntu", "cmd": "cat %s > %s",
                 "args": [{"dep": 0}, {"out": 0}],
                 "resources": {"cpu": 32, "memory": 34359738368},
                 "deps": ["in"]}
            ]
        }"#;
        let spec: GraphSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.root, "out");
        let out = spec.find_node("out").unwrap();
        match &out.op {
            OpSpec::Exec {
                args,
                outputs,
                resources,
                ..
            } => {
                assert_eq!(args, &vec![ExecArg::Dep(0), ExecArg::Out(0)]);
                assert_eq!(outputs, &vec![OutputKind::File]);
                assert_eq!(resources.cpu, 32);
                assert_eq!(resources.disk, 0);
            }
            other => panic!("unexpected op {:?}", other),
        }
        assert_eq!(out.deps, vec!["in".to_string()]);
    }
}
