use flowcore::{
    Digester, ExecArg, ExecSpec, FlowGraph, GraphError, Mapper, NodeId, OutputKind, Resources,
    Value,
};
use flowruntime::{FactoryMetadata, MapperFactory, ParamDefinition};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Runs one command per mapped item.
///
/// The first `%s` of `cmd` receives the item; every further `%s` is a
/// file output, so `"gzip -c %s > %s"` yields one file per item.
#[derive(Debug, Clone)]
pub struct ExecEach {
    image: String,
    cmd: String,
    resources: Resources,
}

impl ExecEach {
    pub fn new(image: impl Into<String>, cmd: impl Into<String>) -> Result<Self, GraphError> {
        let cmd = cmd.into();
        if !cmd.contains("%s") {
            return Err(GraphError::invalid_node(
                "exec_each",
                "command needs a %s for the mapped item",
            ));
        }
        Ok(Self {
            image: image.into(),
            cmd,
            resources: Resources::ZERO,
        })
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    fn spec(&self) -> ExecSpec {
        let outputs = self.cmd.matches("%s").count() - 1;
        let args = std::iter::once(ExecArg::Dep(0))
            .chain((0..outputs).map(ExecArg::Out))
            .collect();
        ExecSpec::new(self.image.clone(), self.cmd.clone())
            .with_args(args)
            .with_outputs(vec![OutputKind::File; outputs])
            .with_resources(self.resources)
    }
}

impl Mapper for ExecEach {
    fn name(&self) -> &str {
        "exec_each"
    }

    fn write_digest(&self, d: &mut Digester) {
        d.write_str(&self.image)
            .write_str(&self.cmd)
            .write_u64(self.resources.cpu)
            .write_u64(self.resources.memory)
            .write_u64(self.resources.disk);
    }

    fn apply(&self, item: &Value, graph: &mut FlowGraph) -> Result<NodeId, GraphError> {
        let input = graph.val(item.clone());
        graph.exec(self.spec(), vec![input])
    }
}

pub struct ExecEachFactory;

fn param<'a>(params: &'a BTreeMap<String, Value>, name: &str) -> Option<&'a Value> {
    params.get(name)
}

fn amount(params: &BTreeMap<String, Value>, name: &str) -> Result<u64, GraphError> {
    match param(params, name) {
        None => Ok(0),
        Some(Value::Int(n)) if *n >= 0 => Ok(*n as u64),
        Some(other) => Err(GraphError::invalid_node(
            "exec_each",
            format!("{} must be a non-negative int, got {}", name, other.kind()),
        )),
    }
}

impl MapperFactory for ExecEachFactory {
    fn create(&self, params: &Value) -> Result<Arc<dyn Mapper>, GraphError> {
        let params = match params {
            Value::Struct(fields) | Value::Map(fields) => fields,
            other => {
                return Err(GraphError::invalid_node(
                    "exec_each",
                    format!("params must be a struct, got {}", other.kind()),
                ))
            }
        };
        let cmd = param(params, "cmd")
            .and_then(Value::as_str)
            .ok_or_else(|| GraphError::invalid_node("exec_each", "missing string param cmd"))?;
        let image = param(params, "image").and_then(Value::as_str).unwrap_or_default();
        let resources = Resources::new(
            amount(params, "cpu")?,
            amount(params, "memory")?,
            amount(params, "disk")?,
        );
        Ok(Arc::new(ExecEach::new(image, cmd)?.with_resources(resources)))
    }

    fn name(&self) -> &str {
        "exec_each"
    }

    fn metadata(&self) -> FactoryMetadata {
        let def = |name: &str, description: &str, required: bool| ParamDefinition {
            name: name.to_string(),
            description: description.to_string(),
            required,
        };
        FactoryMetadata {
            description: "Run a command once per file of a list or directory".to_string(),
            category: "exec".to_string(),
            params: vec![
                def("cmd", "Command template; the first %s is the item, the rest are outputs", true),
                def("image", "Container image (docker mode)", false),
                def("cpu", "CPUs per command", false),
                def("memory", "Memory per command, in bytes", false),
                def("disk", "Disk per command, in bytes", false),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore::{FileRef, Op};

    #[test]
    fn test_each_item_becomes_an_exec() {
        let mapper = ExecEach::new("ubuntu", "gzip -c %s > %s").unwrap();
        let mut graph = FlowGraph::new();
        let item = Value::File(FileRef::new(flowcore::Digest::of_bytes(b"a"), 1));
        let id = mapper.apply(&item, &mut graph).unwrap();
        match graph.node(id).op() {
            Op::Exec(spec) => {
                assert_eq!(spec.args, vec![ExecArg::Dep(0), ExecArg::Out(0)]);
                assert_eq!(spec.outputs, vec![OutputKind::File]);
            }
            other => panic!("unexpected op {}", other.name()),
        }
        // Same item, same node.
        assert_eq!(mapper.apply(&item, &mut graph).unwrap(), id);
    }

    #[test]
    fn test_factory_reads_params() {
        let mut params = BTreeMap::new();
        params.insert("cmd".to_string(), Value::String("wc -l %s > %s".to_string()));
        params.insert("cpu".to_string(), Value::Int(2));
        assert!(ExecEachFactory.create(&Value::Map(params.clone())).is_ok());

        params.insert("cmd".to_string(), Value::String("true".to_string()));
        assert!(ExecEachFactory.create(&Value::Map(params)).is_err());
        assert!(ExecEachFactory.create(&Value::Unit).is_err());
    }
}
