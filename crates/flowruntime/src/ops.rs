//! Semantics of the ops evaluated in process, and materialization of the
//! ops sent to executors.

use flowcore::{
    Coercion, Digest, EvalError, ExecArg, ExecConfig, ExecResult, FileRef, JoinKind, Op,
    ResolvedArg, Value,
};
use regex::Regex;
use std::collections::BTreeMap;

/// Evaluate a pure op over its resolved dependency values.
pub fn eval_pure(op: &Op, digest: Digest, deps: &[Value]) -> Result<Value, EvalError> {
    match op {
        Op::Val(v) => Ok(v.clone()),
        Op::Coerce(c) => coerce(c, digest, single(deps, digest)?),
        Op::Collect {
            pattern,
            replacement,
        } => collect(pattern, replacement, digest, single(deps, digest)?),
        Op::GroupBy { pattern } => group_by(pattern, digest, single(deps, digest)?),
        Op::Join(JoinKind::List) => Ok(Value::List(deps.to_vec())),
        Op::Join(JoinKind::Tuple) => Ok(Value::Tuple(deps.to_vec())),
        Op::Merge => merge(digest, deps),
        other => Err(EvalError::type_error(
            digest,
            format!("{} is not evaluated in process", other.name()),
        )),
    }
}

fn single(deps: &[Value], digest: Digest) -> Result<&Value, EvalError> {
    match deps {
        [v] => Ok(v),
        _ => Err(EvalError::type_error(
            digest,
            format!("expected 1 dependency, got {}", deps.len()),
        )),
    }
}

fn expected(digest: Digest, want: &str, got: &Value) -> EvalError {
    EvalError::type_error(digest, format!("expected {}, got {}", want, got.kind()))
}

fn compile(pattern: &str, digest: Digest) -> Result<Regex, EvalError> {
    Regex::new(pattern).map_err(|e| EvalError::type_error(digest, e.to_string()))
}

fn coerce(c: &Coercion, digest: Digest, v: &Value) -> Result<Value, EvalError> {
    match (c, v) {
        (Coercion::Field(i), Value::Tuple(fields)) => fields.get(*i).cloned().ok_or_else(|| {
            EvalError::type_error(digest, format!("tuple has no field {}", i))
        }),
        (Coercion::Member(name), Value::Struct(fields)) => fields.get(name).cloned().ok_or_else(|| {
            EvalError::type_error(digest, format!("struct has no member {:?}", name))
        }),
        (Coercion::File, Value::File(f)) => Ok(Value::File(*f)),
        (Coercion::File, Value::Dir(entries)) => match entries.values().next() {
            Some(f) if entries.len() == 1 => Ok(Value::File(*f)),
            _ => Err(EvalError::type_error(
                digest,
                format!("expected a single file, got a directory of {}", entries.len()),
            )),
        },
        (Coercion::Files, Value::Dir(entries)) => {
            Ok(Value::List(entries.values().map(|f| Value::File(*f)).collect()))
        }
        (Coercion::Dir(name), Value::File(f)) => {
            let mut entries = BTreeMap::new();
            entries.insert(name.clone(), *f);
            Ok(Value::Dir(entries))
        }
        (Coercion::Field(_), other) => Err(expected(digest, "tuple", other)),
        (Coercion::Member(_), other) => Err(expected(digest, "struct", other)),
        (Coercion::File, other) => Err(expected(digest, "file or dir", other)),
        (Coercion::Files, other) => Err(expected(digest, "dir", other)),
        (Coercion::Dir(_), other) => Err(expected(digest, "file", other)),
    }
}

fn insert_unique(
    entries: &mut BTreeMap<String, FileRef>,
    key: String,
    file: FileRef,
    digest: Digest,
) -> Result<(), EvalError> {
    match entries.get(&key) {
        Some(existing) if *existing != file => Err(EvalError::type_error(
            digest,
            format!("conflicting entries for {:?}", key),
        )),
        _ => {
            entries.insert(key, file);
            Ok(())
        }
    }
}

fn collect(pattern: &str, replacement: &str, digest: Digest, v: &Value) -> Result<Value, EvalError> {
    let entries = v.as_dir().ok_or_else(|| expected(digest, "dir", v))?;
    let re = compile(pattern, digest)?;
    let mut out = BTreeMap::new();
    for (key, file) in entries {
        if !re.is_match(key) {
            continue;
        }
        let renamed = if replacement.is_empty() {
            key.clone()
        } else {
            re.replace(key, replacement).into_owned()
        };
        insert_unique(&mut out, renamed, *file, digest)?;
    }
    Ok(Value::Dir(out))
}

fn group_by(pattern: &str, digest: Digest, v: &Value) -> Result<Value, EvalError> {
    let entries = v.as_dir().ok_or_else(|| expected(digest, "dir", v))?;
    let re = compile(pattern, digest)?;
    let mut groups: BTreeMap<String, BTreeMap<String, FileRef>> = BTreeMap::new();
    for (key, file) in entries {
        if let Some(group) = re.captures(key).and_then(|caps| caps.get(1)) {
            groups
                .entry(group.as_str().to_string())
                .or_default()
                .insert(key.clone(), *file);
        }
    }
    Ok(Value::List(groups.into_values().map(Value::Dir).collect()))
}

fn merge(digest: Digest, deps: &[Value]) -> Result<Value, EvalError> {
    let mut out = BTreeMap::new();
    for v in deps {
        let entries = v.as_dir().ok_or_else(|| expected(digest, "dir", v))?;
        for (key, file) in entries {
            insert_unique(&mut out, key.clone(), *file, digest)?;
        }
    }
    Ok(Value::Dir(out))
}

/// Build the unit of work for a dispatched op from its dependency values.
pub fn exec_config(op: &Op, digest: Digest, deps: &[Value]) -> Result<ExecConfig, EvalError> {
    match op {
        Op::Intern { url } => Ok(ExecConfig::Intern { url: url.clone() }),
        Op::Extern { url } => Ok(ExecConfig::Extern {
            url: url.clone(),
            value: single(deps, digest)?.clone(),
        }),
        Op::Exec(spec) => {
            let args = spec
                .args
                .iter()
                .map(|arg| match *arg {
                    ExecArg::Dep(i) => deps
                        .get(i)
                        .cloned()
                        .map(ResolvedArg::Input)
                        .ok_or_else(|| EvalError::type_error(digest, format!("missing dependency {}", i))),
                    ExecArg::Out(i) => Ok(ResolvedArg::Output(i)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ExecConfig::Exec {
                image: spec.image.clone(),
                cmd: spec.cmd.clone(),
                args,
                outputs: spec.outputs.clone(),
                resources: spec.resources,
            })
        }
        other => Err(EvalError::type_error(
            digest,
            format!("{} is not dispatched to executors", other.name()),
        )),
    }
}

/// Interpret a successful exec result as the node's value.
pub fn exec_value(config: &ExecConfig, digest: Digest, result: ExecResult) -> Result<Value, EvalError> {
    let want = match config {
        ExecConfig::Intern { .. } => 1,
        ExecConfig::Extern { .. } => 0,
        ExecConfig::Exec { outputs, .. } => outputs.len(),
    };
    if result.outputs.len() != want {
        return Err(EvalError::type_error(
            digest,
            format!("executor returned {} output(s), expected {}", result.outputs.len(), want),
        ));
    }
    let mut outputs = result.outputs;
    Ok(match outputs.len() {
        0 => Value::Unit,
        1 => outputs.remove(0),
        _ => Value::Tuple(outputs),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(name: &str) -> FileRef {
        FileRef::new(Digest::of_bytes(name.as_bytes()), name.len() as u64)
    }

    fn dir(names: &[&str]) -> Value {
        Value::Dir(names.iter().map(|n| (n.to_string(), f(n))).collect())
    }

    fn d() -> Digest {
        Digest::of_bytes(b"node")
    }

    #[test]
    fn test_coercions() {
        let t = Value::Tuple(vec![Value::Int(1), Value::from("a")]);
        assert_eq!(coerce(&Coercion::Field(1), d(), &t), Ok(Value::from("a")));
        assert!(coerce(&Coercion::Field(2), d(), &t).is_err());
        assert_eq!(coerce(&Coercion::File, d(), &dir(&["x"])), Ok(Value::File(f("x"))));
        assert!(coerce(&Coercion::File, d(), &dir(&["x", "y"])).is_err());
        assert_eq!(
            coerce(&Coercion::Files, d(), &dir(&["b", "a"])),
            Ok(Value::List(vec![Value::File(f("a")), Value::File(f("b"))]))
        );
        assert!(matches!(
            coerce(&Coercion::Member("x".into()), d(), &Value::Int(3)),
            Err(EvalError::Type { .. })
        ));
    }

    #[test]
    fn test_collect_filters_and_renames() {
        let v = dir(&["a.txt", "b.txt", "c.bam"]);
        let out = collect(r"^(.*)\.txt$", "$1.out", d(), &v).unwrap();
        let keys: Vec<_> = out.as_dir().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["a.out".to_string(), "b.out".to_string()]);
    }

    #[test]
    fn test_group_by_first_capture() {
        let v = dir(&["s1_r1.fq", "s1_r2.fq", "s2_r1.fq", "other"]);
        let out = group_by(r"^(s\d+)_", d(), &v).unwrap();
        let groups = out.as_list().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].as_dir().unwrap().len(), 2);
        assert_eq!(groups[1].as_dir().unwrap().len(), 1);
    }

    #[test]
    fn test_merge_rejects_conflicts() {
        let a = dir(&["x", "y"]);
        let b = dir(&["y", "z"]);
        assert_eq!(merge(d(), &[a.clone(), b]).unwrap().as_dir().unwrap().len(), 3);
        let mut conflicting = std::collections::BTreeMap::new();
        conflicting.insert("x".to_string(), f("different"));
        assert!(merge(d(), &[a, Value::Dir(conflicting)]).is_err());
    }

    #[test]
    fn test_exec_value_shapes() {
        let config = ExecConfig::Exec {
            image: "ubuntu".into(),
            cmd: "true".into(),
            args: vec![],
            outputs: vec![flowcore::OutputKind::File, flowcore::OutputKind::Dir],
            resources: Default::default(),
        };
        let two = ExecResult::success(vec![Value::File(f("a")), dir(&["b"])]);
        assert!(matches!(exec_value(&config, d(), two), Ok(Value::Tuple(_))));
        let short = ExecResult::success(vec![Value::File(f("a"))]);
        assert!(exec_value(&config, d(), short).is_err());
    }
}
