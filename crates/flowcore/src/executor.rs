use crate::{Digest, ExecutorError, FileRef, OutputKind, Repository, Resources, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Argument of a materialized exec, in command-template order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedArg {
    Input(Value),
    Output(usize),
}

/// Unit of work submitted to an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecConfig {
    Intern {
        url: String,
    },
    Extern {
        url: String,
        value: Value,
    },
    Exec {
        image: String,
        cmd: String,
        args: Vec<ResolvedArg>,
        outputs: Vec<OutputKind>,
        resources: Resources,
    },
}

impl ExecConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecConfig::Intern { .. } => "intern",
            ExecConfig::Extern { .. } => "extern",
            ExecConfig::Exec { .. } => "exec",
        }
    }

    pub fn resources(&self) -> Resources {
        match self {
            ExecConfig::Exec { resources, .. } => *resources,
            _ => Resources::ZERO,
        }
    }

    /// Repository objects the exec reads.
    pub fn input_files(&self) -> Vec<FileRef> {
        match self {
            ExecConfig::Intern { .. } => Vec::new(),
            ExecConfig::Extern { value, .. } => value.files(),
            ExecConfig::Exec { args, .. } => args
                .iter()
                .flat_map(|a| match a {
                    ResolvedArg::Input(v) => v.files(),
                    ResolvedArg::Output(_) => Vec::new(),
                })
                .collect(),
        }
    }
}

/// Outcome of a finished exec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    /// One value per declared output (intern: the fetched file or dir).
    pub outputs: Vec<Value>,
    #[serde(default)]
    pub stderr: Option<String>,
}

impl ExecResult {
    pub fn success(outputs: Vec<Value>) -> Self {
        Self {
            exit_code: 0,
            outputs,
            stderr: None,
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            outputs: Vec::new(),
            stderr: Some(stderr.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Handle to a submitted unit of work.
#[async_trait]
pub trait Exec: Send + Sync {
    fn id(&self) -> Digest;

    fn config(&self) -> &ExecConfig;

    /// Wait for completion. A non-zero exit is reported in the result, not as an error.
    async fn wait(&self) -> Result<ExecResult, ExecutorError>;
}

/// Compute capability consumed by the evaluator.
///
/// Resubmission is not assumed to be idempotent; the evaluator submits
/// each id at most once at a time.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name used in logs and status reports.
    fn name(&self) -> &str;

    /// Submit a unit of work under `id`.
    async fn put(&self, id: Digest, config: ExecConfig) -> Result<Arc<dyn Exec>, ExecutorError>;

    /// Look up a previously submitted exec.
    async fn get(&self, id: Digest) -> Result<Arc<dyn Exec>, ExecutorError>;

    /// Cancel and forget an exec.
    async fn remove(&self, id: Digest) -> Result<(), ExecutorError>;

    /// All execs currently known to the executor.
    async fn execs(&self) -> Result<Vec<Arc<dyn Exec>>, ExecutorError>;

    /// Total capacity.
    fn resources(&self) -> Resources;

    /// Repository the executor reads inputs from and writes outputs to.
    fn repository(&self) -> Arc<dyn Repository>;
}
