use crate::cache::CacheCoordinator;
use crate::config::EvalConfig;
use crate::eval::Eval;
use crate::loader::GraphLoader;
use crate::pool::ExecutorPool;
use crate::registry::ContinuationRegistry;
use flowcore::{
    EvalError, EventBus, ExecutionEvent, ExecutionId, FlowError, FlowGraph, GraphError, GraphSpec,
    NodeId, Value,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Main entry point: evaluates graphs against a shared executor pool and cache
pub struct FlowRuntime {
    pool: Arc<ExecutorPool>,
    cache: Arc<CacheCoordinator>,
    registry: Arc<ContinuationRegistry>,
    event_bus: Arc<EventBus>,
    config: RuntimeConfig,
}

impl FlowRuntime {
    /// Create a runtime with default settings
    pub fn new(pool: Arc<ExecutorPool>, cache: Arc<CacheCoordinator>) -> Self {
        Self::with_config(pool, cache, RuntimeConfig::default())
    }

    /// Create a runtime with custom configuration
    pub fn with_config(pool: Arc<ExecutorPool>, cache: Arc<CacheCoordinator>, config: RuntimeConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        Self {
            pool,
            cache,
            registry: Arc::new(ContinuationRegistry::new()),
            event_bus,
            config,
        }
    }

    /// Use a pre-populated continuation registry
    pub fn with_registry(mut self, registry: Arc<ContinuationRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Arc<ContinuationRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ExecutorPool> {
        &self.pool
    }

    /// Cache coordinator; `cache().digests()` lists every digest seen.
    pub fn cache(&self) -> &Arc<CacheCoordinator> {
        &self.cache
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Prepare an evaluation without running it, e.g. to watch its status board.
    pub fn evaluation(&self, graph: FlowGraph, root: NodeId) -> Eval {
        let execution_id = ExecutionId::new_v4();
        Eval::new(
            graph,
            root,
            self.config.eval.clone(),
            Arc::clone(&self.pool),
            Arc::clone(&self.cache),
        )
        .with_events(self.event_bus.create_emitter(execution_id))
    }

    /// Evaluate `root` to completion.
    pub async fn evaluate(&self, graph: FlowGraph, root: NodeId) -> Result<Value, EvalError> {
        self.evaluate_with_cancel(graph, root, CancellationToken::new()).await
    }

    pub async fn evaluate_with_cancel(
        &self,
        graph: FlowGraph,
        root: NodeId,
        cancel: CancellationToken,
    ) -> Result<Value, EvalError> {
        self.evaluation(graph, root).run(cancel).await
    }

    /// Build a graph file's graph using this runtime's registry.
    pub fn load(&self, spec: &GraphSpec) -> Result<(FlowGraph, NodeId), GraphError> {
        GraphLoader::new(&self.registry).load(spec)
    }

    /// Load and evaluate a graph file.
    pub async fn evaluate_spec(&self, spec: &GraphSpec, cancel: CancellationToken) -> Result<Value, FlowError> {
        let (graph, root) = self.load(spec)?;
        tracing::info!(
            "Loaded graph {} ({} nodes)",
            spec.name.as_deref().unwrap_or("<unnamed>"),
            graph.len()
        );
        Ok(self.evaluate_with_cancel(graph, root, cancel).await?)
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub eval: EvalConfig,
    pub event_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            eval: EvalConfig::default(),
            event_buffer_size: 1000,
        }
    }
}
