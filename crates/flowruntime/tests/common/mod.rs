// Shared fakes for the runtime integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use flowcore::{
    Assoc, Digest, Exec, ExecConfig, ExecResult, Executor, ExecutorError, FileRef, OutputKind,
    Repository, RepositoryError, Resources, Value,
};
use flowruntime::{
    CacheCoordinator, EvalConfig, ExecutorPool, FlowRuntime, RetryPolicy, RuntimeConfig,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct FakeRepository {
    objects: Mutex<HashMap<Digest, Bytes>>,
}

impl FakeRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl Repository for FakeRepository {
    async fn get(&self, id: &Digest) -> Result<Bytes, RepositoryError> {
        self.objects
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(RepositoryError::NotFound(*id))
    }

    async fn put(&self, data: Bytes) -> Result<Digest, RepositoryError> {
        let id = Digest::of_bytes(&data);
        self.objects.lock().unwrap().insert(id, data);
        Ok(id)
    }

    async fn stat(&self, id: &Digest) -> Result<FileRef, RepositoryError> {
        self.objects
            .lock()
            .unwrap()
            .get(id)
            .map(|data| FileRef::new(*id, data.len() as u64))
            .ok_or(RepositoryError::NotFound(*id))
    }
}

#[derive(Default)]
pub struct FakeAssoc {
    entries: Mutex<HashMap<Digest, Digest>>,
}

#[async_trait]
impl Assoc for FakeAssoc {
    async fn get(&self, key: &Digest) -> Result<Option<Digest>, RepositoryError> {
        Ok(self.entries.lock().unwrap().get(key).copied())
    }

    async fn put(&self, key: Digest, value: Digest) -> Result<(), RepositoryError> {
        self.entries.lock().unwrap().insert(key, value);
        Ok(())
    }
}

/// Decides the result of an exec from its config and how many times its id
/// has been submitted (starting at 1). `None` means the default success.
pub type Behaviour = Arc<dyn Fn(&ExecConfig, usize) -> Option<Result<ExecResult, ExecutorError>> + Send + Sync>;

pub fn behaviour<F>(f: F) -> Behaviour
where
    F: Fn(&ExecConfig, usize) -> Option<Result<ExecResult, ExecutorError>> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Default)]
struct Record {
    puts: Vec<(Digest, &'static str)>,
    removed: Vec<Digest>,
    execs: HashMap<Digest, Arc<FakeExec>>,
    in_use: Resources,
    peak: Resources,
}

/// In-process executor that fabricates outputs and records what it was asked to do.
pub struct FakeExecutor {
    name: String,
    capacity: Resources,
    repository: Arc<dyn Repository>,
    delay: Duration,
    slow: Option<(String, Duration)>,
    behaviour: Option<Behaviour>,
    record: Arc<Mutex<Record>>,
}

impl FakeExecutor {
    pub fn new(name: &str, capacity: Resources) -> Self {
        Self {
            name: name.to_string(),
            capacity,
            repository: FakeRepository::new(),
            delay: Duration::ZERO,
            slow: None,
            behaviour: None,
            record: Arc::default(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Execs whose command starts with `prefix` take `delay` instead.
    pub fn with_slow(mut self, prefix: &str, delay: Duration) -> Self {
        self.slow = Some((prefix.to_string(), delay));
        self
    }

    pub fn with_behaviour(mut self, behaviour: Behaviour) -> Self {
        self.behaviour = Some(behaviour);
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = repository;
        self
    }

    pub fn puts(&self) -> usize {
        self.record.lock().unwrap().puts.len()
    }

    pub fn puts_of(&self, kind: &str) -> usize {
        self.record.lock().unwrap().puts.iter().filter(|(_, k)| *k == kind).count()
    }

    /// Digests of submitted execs of `kind`, in submission order.
    pub fn put_order(&self, kind: &str) -> Vec<Digest> {
        self.record
            .lock()
            .unwrap()
            .puts
            .iter()
            .filter(|(_, k)| *k == kind)
            .map(|(d, _)| *d)
            .collect()
    }

    pub fn removed(&self) -> Vec<Digest> {
        self.record.lock().unwrap().removed.clone()
    }

    /// Largest sum of resources held by concurrently running execs.
    pub fn peak(&self) -> Resources {
        self.record.lock().unwrap().peak
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, id: Digest, config: ExecConfig) -> Result<Arc<dyn Exec>, ExecutorError> {
        let mut record = self.record.lock().unwrap();
        record.puts.push((id, config.kind()));
        let attempt = record.puts.iter().filter(|(d, _)| *d == id).count();
        let outcome = self.behaviour.as_ref().and_then(|b| b(&config, attempt));
        let delay = match (&self.slow, &config) {
            (Some((prefix, slow)), ExecConfig::Exec { cmd, .. }) if cmd.starts_with(prefix.as_str()) => *slow,
            _ => self.delay,
        };
        let exec = Arc::new(FakeExec {
            id,
            config,
            outcome,
            delay,
            repository: Arc::clone(&self.repository),
            record: Arc::clone(&self.record),
        });
        record.execs.insert(id, Arc::clone(&exec));
        Ok(exec)
    }

    async fn get(&self, id: Digest) -> Result<Arc<dyn Exec>, ExecutorError> {
        let record = self.record.lock().unwrap();
        match record.execs.get(&id) {
            Some(exec) => Ok(Arc::clone(exec) as Arc<dyn Exec>),
            None => Err(ExecutorError::NotFound(id)),
        }
    }

    async fn remove(&self, id: Digest) -> Result<(), ExecutorError> {
        let mut record = self.record.lock().unwrap();
        record.removed.push(id);
        record.execs.remove(&id);
        Ok(())
    }

    async fn execs(&self) -> Result<Vec<Arc<dyn Exec>>, ExecutorError> {
        let record = self.record.lock().unwrap();
        Ok(record.execs.values().map(|e| Arc::clone(e) as Arc<dyn Exec>).collect())
    }

    fn resources(&self) -> Resources {
        self.capacity
    }

    fn repository(&self) -> Arc<dyn Repository> {
        Arc::clone(&self.repository)
    }
}

pub struct FakeExec {
    id: Digest,
    config: ExecConfig,
    outcome: Option<Result<ExecResult, ExecutorError>>,
    delay: Duration,
    repository: Arc<dyn Repository>,
    record: Arc<Mutex<Record>>,
}

/// Resources held while an exec runs, released even if the wait is dropped.
struct InUse {
    record: Arc<Mutex<Record>>,
    resources: Resources,
}

impl InUse {
    fn enter(record: &Arc<Mutex<Record>>, resources: Resources) -> Self {
        let mut r = record.lock().unwrap();
        r.in_use += resources;
        r.peak = Resources {
            cpu: r.peak.cpu.max(r.in_use.cpu),
            memory: r.peak.memory.max(r.in_use.memory),
            disk: r.peak.disk.max(r.in_use.disk),
        };
        Self {
            record: Arc::clone(record),
            resources,
        }
    }
}

impl Drop for InUse {
    fn drop(&mut self) {
        self.record.lock().unwrap().in_use -= self.resources;
    }
}

#[async_trait]
impl Exec for FakeExec {
    fn id(&self) -> Digest {
        self.id
    }

    fn config(&self) -> &ExecConfig {
        &self.config
    }

    async fn wait(&self) -> Result<ExecResult, ExecutorError> {
        let _in_use = InUse::enter(&self.record, self.config.resources());
        tokio::time::sleep(self.delay).await;
        match &self.outcome {
            Some(outcome) => outcome.clone(),
            None => self.fabricate().await,
        }
    }
}

impl FakeExec {
    async fn fabricate(&self) -> Result<ExecResult, ExecutorError> {
        match &self.config {
            ExecConfig::Intern { url } => {
                let file = self.store(url.clone()).await?;
                Ok(ExecResult::success(vec![Value::File(file)]))
            }
            ExecConfig::Extern { .. } => Ok(ExecResult::success(Vec::new())),
            ExecConfig::Exec { cmd, outputs, .. } => {
                let mut values = Vec::new();
                for (i, kind) in outputs.iter().enumerate() {
                    let file = self.store(format!("{} {} output {}", self.id, cmd, i)).await?;
                    values.push(match kind {
                        OutputKind::File => Value::File(file),
                        OutputKind::Dir => {
                            let mut entries = BTreeMap::new();
                            entries.insert("out".to_string(), file);
                            Value::Dir(entries)
                        }
                    });
                }
                Ok(ExecResult::success(values))
            }
        }
    }

    async fn store(&self, contents: String) -> Result<FileRef, ExecutorError> {
        let data = Bytes::from(contents);
        let size = data.len() as u64;
        let id = self.repository.put(data).await?;
        Ok(FileRef::new(id, size))
    }
}

/// Settings that keep tests fast.
pub fn quick_config() -> RuntimeConfig {
    RuntimeConfig {
        eval: EvalConfig {
            retry: RetryPolicy::default().with_delay(10),
            ..EvalConfig::default()
        },
        ..RuntimeConfig::default()
    }
}

pub fn runtime_with(executors: Vec<Arc<dyn Executor>>, cache: Arc<CacheCoordinator>) -> FlowRuntime {
    FlowRuntime::with_config(ExecutorPool::new(executors), cache, quick_config())
}

pub fn runtime(executor: Arc<FakeExecutor>) -> FlowRuntime {
    runtime_with(vec![executor as Arc<dyn Executor>], CacheCoordinator::new())
}
