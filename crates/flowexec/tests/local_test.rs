use bytes::Bytes;
use flowcore::{
    EvalError, ExecArg, ExecConfig, ExecSpec, Executor, ExecutorError, FlowGraph, OutputKind,
    Repository, ResolvedArg, Resources, Value, GIB,
};
use flowexec::{ExecEach, FileAssoc, FileRepository, LocalExecutor, MemoryRepository};
use flowruntime::{CacheCoordinator, ExecutorPool, FlowRuntime, ResultCache};
use std::sync::Arc;
use std::time::Duration;

fn shell(repository: Arc<dyn Repository>) -> Arc<LocalExecutor> {
    Arc::new(LocalExecutor::new("local", Resources::new(4, 8 * GIB, 0), repository))
}

async fn read(repository: &dyn Repository, value: &Value) -> String {
    let file = value.as_file().expect("a file");
    let data = repository.get(&file.id).await.unwrap();
    String::from_utf8(data.to_vec()).unwrap()
}

#[tokio::test]
async fn test_shell_exec_writes_output() {
    let repository: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    let executor = shell(Arc::clone(&repository));
    let input = repository.put(Bytes::from_static(b"a\nb\nc\n")).await.unwrap();
    let config = ExecConfig::Exec {
        image: String::new(),
        cmd: "wc -l < %s | tr -d ' ' > %s".to_string(),
        args: vec![
            ResolvedArg::Input(Value::File(flowcore::FileRef::new(input, 6))),
            ResolvedArg::Output(0),
        ],
        outputs: vec![OutputKind::File],
        resources: Resources::new(1, 0, 0),
    };

    let exec = executor.put(input, config).await.unwrap();
    let result = exec.wait().await.unwrap();
    assert!(result.is_success());
    assert_eq!(read(repository.as_ref(), &result.outputs[0]).await.trim(), "3");
    assert_eq!(executor.in_use(), Resources::ZERO);
}

#[tokio::test]
async fn test_non_zero_exit_is_reported() {
    let repository: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    let executor = shell(repository);
    let config = ExecConfig::Exec {
        image: String::new(),
        cmd: "echo boom >&2; exit 3".to_string(),
        args: Vec::new(),
        outputs: Vec::new(),
        resources: Resources::ZERO,
    };
    let exec = executor.put(flowcore::Digest::of_bytes(b"boom"), config).await.unwrap();
    let result = exec.wait().await.unwrap();
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.stderr.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_overcommit_is_refused() {
    let executor = shell(Arc::new(MemoryRepository::new()));
    let config = |cpu| ExecConfig::Exec {
        image: String::new(),
        cmd: "sleep 5".to_string(),
        args: Vec::new(),
        outputs: Vec::new(),
        resources: Resources::new(cpu, 0, 0),
    };
    let first = flowcore::Digest::of_bytes(b"first");
    executor.put(first, config(3)).await.unwrap();
    let refused = executor.put(flowcore::Digest::of_bytes(b"second"), config(2)).await;
    assert!(matches!(refused, Err(ExecutorError::Overcommitted { .. })));

    // Removing the running exec gives its resources back.
    executor.remove(first).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(executor.in_use(), Resources::ZERO);
    assert!(executor.execs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_removed_exec_reports_cancelled() {
    let executor = shell(Arc::new(MemoryRepository::new()));
    let id = flowcore::Digest::of_bytes(b"slow");
    let config = ExecConfig::Exec {
        image: String::new(),
        cmd: "sleep 30".to_string(),
        args: Vec::new(),
        outputs: Vec::new(),
        resources: Resources::ZERO,
    };
    let exec = executor.put(id, config).await.unwrap();
    executor.remove(id).await.unwrap();
    let waited = tokio::time::timeout(Duration::from_secs(5), exec.wait()).await.unwrap();
    assert_eq!(waited.unwrap_err(), ExecutorError::Cancelled);
}

#[tokio::test]
async fn test_unsupported_scheme_is_terminal() {
    let executor = shell(Arc::new(MemoryRepository::new()));
    let exec = executor
        .put(
            flowcore::Digest::of_bytes(b"s3"),
            ExecConfig::Intern {
                url: "s3://bucket/key".to_string(),
            },
        )
        .await
        .unwrap();
    let err = exec.wait().await.unwrap_err();
    assert!(matches!(err, ExecutorError::Unsupported(_)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_evaluate_with_local_files() {
    let inputs = tempfile::tempdir().unwrap();
    std::fs::write(inputs.path().join("a.txt"), "one\ntwo\n").unwrap();
    std::fs::write(inputs.path().join("b.txt"), "three\n").unwrap();
    let store = tempfile::tempdir().unwrap();

    let repository: Arc<dyn Repository> = Arc::new(FileRepository::open(store.path()).unwrap());
    let results = ResultCache::new(Arc::clone(&repository), Arc::new(FileAssoc::open(store.path()).unwrap()));
    let executor = shell(Arc::clone(&repository));
    let runtime = FlowRuntime::new(
        ExecutorPool::single(executor as Arc<dyn Executor>),
        CacheCoordinator::with_results(results),
    );

    let mut g = FlowGraph::new();
    let dir = g.intern(format!("file://{}", inputs.path().display()));
    let counts = g
        .map(dir, Arc::new(ExecEach::new("", "wc -l < %s | tr -d ' ' > %s").unwrap()))
        .unwrap();
    let value = runtime.evaluate(g, counts).await.unwrap();

    let items = value.as_list().expect("a list");
    assert_eq!(items.len(), 2);
    let mut totals = Vec::new();
    for item in items {
        totals.push(read(repository.as_ref(), item).await.trim().to_string());
    }
    assert_eq!(totals, vec!["2", "1"]);
}

#[tokio::test]
async fn test_failing_command_fails_the_node() {
    let runtime = FlowRuntime::new(
        ExecutorPool::single(shell(Arc::new(MemoryRepository::new())) as Arc<dyn Executor>),
        CacheCoordinator::new(),
    );
    let mut g = FlowGraph::new();
    let input = g.val("hello");
    let spec = ExecSpec::new("", "test %s = goodbye")
        .with_args(vec![ExecArg::Dep(0)])
        .with_outputs(Vec::new());
    let exec = g.exec(spec, vec![input]).unwrap();

    match runtime.evaluate(g, exec).await {
        Err(EvalError::Work { exit_code, .. }) => assert_eq!(exit_code, 1),
        other => panic!("expected a work failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_exec_runs_again_once_fixed() {
    let scratch = tempfile::tempdir().unwrap();
    let marker = scratch.path().join("ready");
    let repository: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    let executor = shell(Arc::clone(&repository));
    let runtime = FlowRuntime::new(
        ExecutorPool::single(Arc::clone(&executor) as Arc<dyn Executor>),
        CacheCoordinator::new(),
    );
    let build = || {
        let mut g = FlowGraph::new();
        let spec = ExecSpec::new("", format!("test -f {} && echo ok > %s", marker.display()))
            .with_args(vec![ExecArg::Out(0)]);
        let out = g.exec(spec, Vec::new()).unwrap();
        (g, out)
    };

    let (g, out) = build();
    match runtime.evaluate(g, out).await {
        Err(EvalError::Work { exit_code, .. }) => assert_eq!(exit_code, 1),
        other => panic!("expected a work failure, got {:?}", other),
    }

    std::fs::write(&marker, b"").unwrap();
    let (g, out) = build();
    let value = runtime.evaluate(g, out).await.unwrap();

    assert_eq!(read(repository.as_ref(), &value).await.trim(), "ok");
    assert!(executor.execs().await.unwrap().is_empty(), "finished execs are not retained");
    assert_eq!(executor.in_use(), Resources::ZERO);
}

#[tokio::test]
async fn test_put_replaces_finished_exec() {
    let repository: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    let executor = shell(repository);
    let id = flowcore::Digest::of_bytes(b"flip");
    let config = |code: i32| ExecConfig::Exec {
        image: String::new(),
        cmd: format!("exit {}", code),
        args: Vec::new(),
        outputs: Vec::new(),
        resources: Resources::ZERO,
    };

    let first = executor.put(id, config(4)).await.unwrap();
    assert_eq!(first.wait().await.unwrap().exit_code, 4);
    let second = executor.put(id, config(0)).await.unwrap();

    assert!(second.wait().await.unwrap().is_success());
    assert_eq!(executor.execs().await.unwrap().len(), 1);
}
