use crate::digest::{Digest, Digester};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reference to an immutable object stored in a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileRef {
    pub id: Digest,
    pub size: u64,
}

impl FileRef {
    pub fn new(id: Digest, size: u64) -> Self {
        Self { id, size }
    }
}

/// Resolved value of a flow node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    File(FileRef),
    Dir(BTreeMap<String, FileRef>),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Struct(BTreeMap<String, Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Short type name, used in type errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::File(_) => "file",
            Value::Dir(_) => "dir",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Struct(_) => "struct",
            Value::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileRef> {
        match self {
            Value::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_dir(&self) -> Option<&BTreeMap<String, FileRef>> {
        match self {
            Value::Dir(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, Value::Unit)
    }

    /// Every file referenced by this value, recursively, in traversal order.
    pub fn files(&self) -> Vec<FileRef> {
        let mut out = Vec::new();
        self.collect_files(&mut out);
        out
    }

    fn collect_files(&self, out: &mut Vec<FileRef>) {
        match self {
            Value::File(f) => out.push(*f),
            Value::Dir(d) => out.extend(d.values().copied()),
            Value::Tuple(vs) | Value::List(vs) => {
                for v in vs {
                    v.collect_files(out);
                }
            }
            Value::Struct(fields) | Value::Map(fields) => {
                for v in fields.values() {
                    v.collect_files(out);
                }
            }
            _ => {}
        }
    }

    /// Canonical content digest of this value.
    pub fn digest(&self) -> Digest {
        let mut d = Digester::new();
        self.write_digest(&mut d);
        d.finish()
    }

    pub fn write_digest(&self, d: &mut Digester) {
        d.write_tag(self.kind());
        match self {
            Value::Unit => {}
            Value::Bool(b) => {
                d.write_u64(*b as u64);
            }
            Value::Int(n) => {
                d.write_i64(*n);
            }
            Value::Float(f) => {
                d.write_u64(f.to_bits());
            }
            Value::String(s) => {
                d.write_str(s);
            }
            Value::File(f) => {
                d.write_digest(&f.id).write_u64(f.size);
            }
            Value::Dir(entries) => {
                d.write_u64(entries.len() as u64);
                for (path, f) in entries {
                    d.write_str(path).write_digest(&f.id).write_u64(f.size);
                }
            }
            Value::Tuple(vs) | Value::List(vs) => {
                d.write_u64(vs.len() as u64);
                for v in vs {
                    v.write_digest(d);
                }
            }
            Value::Struct(fields) | Value::Map(fields) => {
                d.write_u64(fields.len() as u64);
                for (k, v) in fields {
                    d.write_str(k);
                    v.write_digest(d);
                }
            }
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<FileRef> for Value {
    fn from(f: FileRef) -> Self {
        Value::File(f)
    }
}
