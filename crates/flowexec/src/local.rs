//! Executor running work as processes on this machine.

use crate::files;
use crate::intern;
use async_trait::async_trait;
use dashmap::DashMap;
use flowcore::{
    Digest, Exec, ExecConfig, ExecResult, Executor, ExecutorError, OutputKind, Repository,
    ResolvedArg, Resources, Value,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::AbortHandle;

/// Longest stderr excerpt kept in a failed result.
const STDERR_TAIL: usize = 4096;

/// How an exec's command line is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    /// `sh -c` on the host; the image is ignored.
    #[default]
    Shell,
    /// `docker run` of the exec's image with the work directory mounted.
    Docker,
}

type Slot = Option<Result<ExecResult, ExecutorError>>;

/// Runs interns, externs and execs as local processes, each in its own
/// scratch directory, and keeps their files in `repository`.
pub struct LocalExecutor {
    name: String,
    mode: ExecMode,
    capacity: Resources,
    repository: Arc<dyn Repository>,
    scratch: Option<PathBuf>,
    client: reqwest::Client,
    execs: DashMap<Digest, Arc<LocalExec>>,
    in_use: Arc<Mutex<Resources>>,
}

impl LocalExecutor {
    pub fn new(name: impl Into<String>, capacity: Resources, repository: Arc<dyn Repository>) -> Self {
        Self {
            name: name.into(),
            mode: ExecMode::default(),
            capacity,
            repository,
            scratch: None,
            client: reqwest::Client::new(),
            execs: DashMap::new(),
            in_use: Arc::default(),
        }
    }

    pub fn with_mode(mut self, mode: ExecMode) -> Self {
        self.mode = mode;
        self
    }

    /// Create scratch directories under `dir` instead of the system temp dir.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch = Some(dir.into());
        self
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    /// Resources held by running execs.
    pub fn in_use(&self) -> Resources {
        self.in_use.lock().map(|r| *r).unwrap_or_default()
    }

    fn reserve(&self, requested: Resources) -> Result<Held, ExecutorError> {
        let mut in_use = self
            .in_use
            .lock()
            .map_err(|_| ExecutorError::Unavailable("resource accounting poisoned".to_string()))?;
        let available = self.capacity - *in_use;
        if !requested.fits_within(&available) {
            return Err(ExecutorError::Overcommitted { requested, available });
        }
        *in_use += requested;
        Ok(Held {
            in_use: Arc::clone(&self.in_use),
            resources: requested,
        })
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, id: Digest, config: ExecConfig) -> Result<Arc<dyn Exec>, ExecutorError> {
        // A running exec is shared; a finished one is replaced.
        if let Some(existing) = self.execs.get(&id) {
            if existing.result.borrow().is_none() {
                return Ok(Arc::clone(existing.value()) as Arc<dyn Exec>);
            }
        }
        let held = self.reserve(config.resources())?;
        let job = Job {
            id,
            mode: self.mode,
            config: config.clone(),
            repository: Arc::clone(&self.repository),
            scratch: self.scratch.clone(),
            client: self.client.clone(),
        };
        let (tx, rx) = watch::channel::<Slot>(None);
        let task = tokio::spawn(async move {
            let result = job.run().await;
            drop(held);
            if let Err(e) = &result {
                tracing::debug!("{} {} failed: {}", job.config.kind(), id.short(), e);
            }
            let _ = tx.send(Some(result));
        });
        tracing::debug!("{} accepted {} {}", self.name, config.kind(), id.short());
        let exec = Arc::new(LocalExec {
            id,
            config,
            result: rx,
            task: task.abort_handle(),
        });
        self.execs.insert(id, Arc::clone(&exec));
        Ok(exec)
    }

    async fn get(&self, id: Digest) -> Result<Arc<dyn Exec>, ExecutorError> {
        self.execs
            .get(&id)
            .map(|e| Arc::clone(e.value()) as Arc<dyn Exec>)
            .ok_or(ExecutorError::NotFound(id))
    }

    async fn remove(&self, id: Digest) -> Result<(), ExecutorError> {
        let (_, exec) = self.execs.remove(&id).ok_or(ExecutorError::NotFound(id))?;
        let running = exec.result.borrow().is_none();
        exec.task.abort();
        if running && self.mode == ExecMode::Docker {
            // Killing the docker client leaves the container behind.
            let status = Command::new("docker")
                .arg("rm")
                .arg("-f")
                .arg(container_name(&id))
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Err(e) = status {
                tracing::warn!("Failed to remove container for {}: {}", id.short(), e);
            }
        }
        Ok(())
    }

    async fn execs(&self) -> Result<Vec<Arc<dyn Exec>>, ExecutorError> {
        Ok(self
            .execs
            .iter()
            .map(|e| Arc::clone(e.value()) as Arc<dyn Exec>)
            .collect())
    }

    fn resources(&self) -> Resources {
        self.capacity
    }

    fn repository(&self) -> Arc<dyn Repository> {
        Arc::clone(&self.repository)
    }
}

/// Resources held by a running job; released when the job ends or is aborted.
struct Held {
    in_use: Arc<Mutex<Resources>>,
    resources: Resources,
}

impl Drop for Held {
    fn drop(&mut self) {
        if let Ok(mut in_use) = self.in_use.lock() {
            *in_use -= self.resources;
        }
    }
}

pub struct LocalExec {
    id: Digest,
    config: ExecConfig,
    result: watch::Receiver<Slot>,
    task: AbortHandle,
}

#[async_trait]
impl Exec for LocalExec {
    fn id(&self) -> Digest {
        self.id
    }

    fn config(&self) -> &ExecConfig {
        &self.config
    }

    async fn wait(&self) -> Result<ExecResult, ExecutorError> {
        let mut rx = self.result.clone();
        // The sender only goes away without a result when the job was aborted.
        let slot = rx
            .wait_for(|slot| slot.is_some())
            .await
            .map_err(|_| ExecutorError::Cancelled)?;
        slot.clone().unwrap_or(Err(ExecutorError::Cancelled))
    }
}

fn container_name(id: &Digest) -> String {
    format!("flow-{}", id)
}

/// Replace each `%s` in `template` with the next of `args`.
fn substitute(template: &str, args: &[String]) -> String {
    let mut line = String::with_capacity(template.len());
    for (i, part) in template.split("%s").enumerate() {
        if i > 0 {
            line.push_str(args.get(i - 1).map(String::as_str).unwrap_or_default());
        }
        line.push_str(part);
    }
    line
}

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_end();
    if text.len() <= STDERR_TAIL {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

struct Job {
    id: Digest,
    mode: ExecMode,
    config: ExecConfig,
    repository: Arc<dyn Repository>,
    scratch: Option<PathBuf>,
    client: reqwest::Client,
}

impl Job {
    async fn run(&self) -> Result<ExecResult, ExecutorError> {
        match &self.config {
            ExecConfig::Intern { url } => {
                let value = intern::fetch(&self.client, self.repository.as_ref(), url).await?;
                Ok(ExecResult::success(vec![value]))
            }
            ExecConfig::Extern { url, value } => {
                intern::export(self.repository.as_ref(), url, value).await?;
                Ok(ExecResult::success(Vec::new()))
            }
            ExecConfig::Exec {
                image,
                cmd,
                args,
                outputs,
                resources,
            } => self.exec(image, cmd, args, outputs, resources).await,
        }
    }

    fn scratch_dir(&self) -> std::io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("flow-");
        match &self.scratch {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        }
    }

    async fn exec(
        &self,
        image: &str,
        cmd: &str,
        args: &[ResolvedArg],
        outputs: &[OutputKind],
        resources: &Resources,
    ) -> Result<ExecResult, ExecutorError> {
        let scratch = self.scratch_dir()?;
        let work = scratch.path();

        let mut substitutions = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            let text = match arg {
                ResolvedArg::Input(value) => self.materialize(value, &work.join(format!("in{}", i))).await?,
                ResolvedArg::Output(j) => {
                    let path = output_path(work, *j);
                    if outputs.get(*j) == Some(&OutputKind::Dir) {
                        tokio::fs::create_dir_all(&path).await?;
                    }
                    path.display().to_string()
                }
            };
            substitutions.push(text);
        }
        let line = substitute(cmd, &substitutions);
        tracing::debug!("Running exec {}: {}", self.id.short(), line);

        let mut command = match self.mode {
            ExecMode::Shell => {
                let mut command = Command::new("sh");
                command.arg("-c").arg(&line).current_dir(work);
                command
            }
            ExecMode::Docker => {
                let mount = format!("{0}:{0}", work.display());
                let mut command = Command::new("docker");
                command
                    .arg("run")
                    .arg("--rm")
                    .arg("--name")
                    .arg(container_name(&self.id))
                    .arg("-v")
                    .arg(mount)
                    .arg("-w")
                    .arg(work);
                if resources.cpu > 0 {
                    command.arg("--cpus").arg(resources.cpu.to_string());
                }
                if resources.memory > 0 {
                    command.arg("--memory").arg(format!("{}b", resources.memory));
                }
                command.arg(image).arg("sh").arg("-c").arg(&line);
                command
            }
        };
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = command.output().await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ExecutorError::Unavailable(format!("{:?} mode needs a program that is not installed", self.mode))
            }
            _ => ExecutorError::Io(e.to_string()),
        })?;
        if !output.stdout.is_empty() {
            tracing::trace!("exec {} stdout: {}", self.id.short(), String::from_utf8_lossy(&output.stdout));
        }
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            return Ok(ExecResult::failed(code, tail(&output.stderr)));
        }

        let mut values = Vec::with_capacity(outputs.len());
        for (j, kind) in outputs.iter().enumerate() {
            let path = output_path(work, j);
            if !tokio::fs::try_exists(&path).await? {
                return Err(ExecutorError::Invalid(format!(
                    "exec {} did not write output {}",
                    self.id.short(),
                    j
                )));
            }
            values.push(match kind {
                OutputKind::File => Value::File(files::store_file(self.repository.as_ref(), &path).await?),
                OutputKind::Dir => Value::Dir(files::store_dir(self.repository.as_ref(), &path).await?),
            });
        }
        Ok(ExecResult::success(values))
    }

    /// Make an input available at or as `path`, returning its command-line text.
    async fn materialize(&self, value: &Value, path: &Path) -> Result<String, ExecutorError> {
        match value {
            Value::List(items) | Value::Tuple(items) => {
                let mut parts = Vec::with_capacity(items.len());
                for (k, item) in items.iter().enumerate() {
                    parts.push(self.materialize_one(item, &path.join(k.to_string())).await?);
                }
                Ok(parts.join(" "))
            }
            other => self.materialize_one(other, path).await,
        }
    }

    async fn materialize_one(&self, value: &Value, path: &Path) -> Result<String, ExecutorError> {
        match value {
            Value::File(file) => {
                files::write_file(self.repository.as_ref(), file, path).await?;
                Ok(path.display().to_string())
            }
            Value::Dir(entries) => {
                files::write_dir(self.repository.as_ref(), entries, path).await?;
                Ok(path.display().to_string())
            }
            Value::Unit => Ok(String::new()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Int(n) => Ok(n.to_string()),
            Value::Float(x) => Ok(x.to_string()),
            Value::String(s) => Ok(s.clone()),
            other => Err(ExecutorError::Invalid(format!(
                "cannot pass a {} as a command argument",
                other.kind()
            ))),
        }
    }
}

fn output_path(work: &Path, index: usize) -> PathBuf {
    work.join(format!("out{}", index))
}
