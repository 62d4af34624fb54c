//! The evaluation loop.
//!
//! An [`Eval`] owns its graph and node table and is the only writer of
//! either. Cache lookups, waits on other claimants and dispatches run in
//! spawned tasks that report back through a `FuturesUnordered`; their
//! results are committed by the loop, which also splices the subgraphs
//! returned by continuations.

use crate::cache::{CacheCoordinator, Claim, ClaimGuard, Outcome};
use crate::config::{CancelMode, ErrorHandling, EvalConfig, SchedulingPolicy};
use crate::dispatch::{Dispatch, Dispatched};
use crate::ops;
use crate::pool::{Admission, ExecutorPool, Reservation};
use chrono::Utc;
use flowcore::{
    Continuation, Digest, EvalError, EventEmitter, ExecConfig, ExecutionEvent, FlowGraph,
    GraphError, Mapper, NodeId, NodeState, NodeStatus, Op, Resources, Value,
};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Live, shareable view of node states during a run.
#[derive(Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<BTreeMap<NodeId, NodeStatus>>>,
}

impl StatusBoard {
    pub fn get(&self, id: NodeId) -> Option<NodeStatus> {
        self.read().get(&id).cloned()
    }

    /// All known nodes, by id.
    pub fn snapshot(&self) -> Vec<NodeStatus> {
        self.read().values().cloned().collect()
    }

    /// Number of nodes in each state.
    pub fn counts(&self) -> HashMap<NodeState, usize> {
        let mut counts = HashMap::new();
        for status in self.read().values() {
            *counts.entry(status.state).or_insert(0) += 1;
        }
        counts
    }

    fn set(&self, status: NodeStatus) {
        let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.insert(status.id, status);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<NodeId, NodeStatus>> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct Entry {
    state: NodeState,
    /// Dependencies not yet done.
    pending: usize,
    dependents: Vec<NodeId>,
    value: Option<Value>,
    error: Option<EvalError>,
    executor: Option<String>,
    /// Root of the subgraph a continuation replaced this node with.
    spliced: Option<NodeId>,
    started: Option<Instant>,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: NodeState::Init,
            pending: 0,
            dependents: Vec::new(),
            value: None,
            error: None,
            executor: None,
            spliced: None,
            started: None,
        }
    }
}

/// A cache miss waiting for executor capacity.
struct Queued {
    id: NodeId,
    digest: Digest,
    resources: Resources,
    config: ExecConfig,
    guard: Option<ClaimGuard>,
    seq: u64,
}

enum TaskResult {
    /// Found in the durable cache.
    Hit(Value),
    /// Computed by another claimant.
    Shared(Outcome),
    /// Not cached; the claim is ours.
    Miss { guard: ClaimGuard, config: ExecConfig },
    Dispatched(Dispatched),
    Abandoned,
    Failed(EvalError),
}

/// Evaluation of one root node.
pub struct Eval {
    graph: FlowGraph,
    root: NodeId,
    config: EvalConfig,
    pool: Arc<ExecutorPool>,
    cache: Arc<CacheCoordinator>,
    events: Option<EventEmitter>,
    board: StatusBoard,
    entries: HashMap<NodeId, Entry>,
    ready: VecDeque<NodeId>,
    queue: Vec<Queued>,
    running: FuturesUnordered<BoxFuture<'static, (NodeId, TaskResult)>>,
    dispatching: usize,
    seq: u64,
    /// Cancels work spawned by this evaluation.
    work: CancellationToken,
    stopping: bool,
    cancelled: bool,
}

impl Eval {
    pub fn new(
        graph: FlowGraph,
        root: NodeId,
        config: EvalConfig,
        pool: Arc<ExecutorPool>,
        cache: Arc<CacheCoordinator>,
    ) -> Self {
        Self {
            graph,
            root,
            config,
            pool,
            cache,
            events: None,
            board: StatusBoard::default(),
            entries: HashMap::new(),
            ready: VecDeque::new(),
            queue: Vec::new(),
            running: FuturesUnordered::new(),
            dispatching: 0,
            seq: 0,
            work: CancellationToken::new(),
            stopping: false,
            cancelled: false,
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn state(&self, id: NodeId) -> Option<NodeState> {
        self.entries.get(&id).map(|e| e.state)
    }

    pub fn value(&self, id: NodeId) -> Option<&Value> {
        self.entries.get(&id).and_then(|e| e.value.as_ref())
    }

    pub fn error(&self, id: NodeId) -> Option<&EvalError> {
        self.entries.get(&id).and_then(|e| e.error.as_ref())
    }

    /// Handle that stays readable while [`run`](Self::run) is in progress.
    pub fn board(&self) -> StatusBoard {
        self.board.clone()
    }

    pub fn status(&self) -> Vec<NodeStatus> {
        self.board.snapshot()
    }

    /// Distinct digests of every node this evaluation has touched.
    pub fn digests(&self) -> Vec<Digest> {
        let mut all: Vec<Digest> = self.entries.keys().map(|id| self.graph.digest(*id)).collect();
        all.sort();
        all.dedup();
        all
    }

    /// Evaluate the root. Returns its value, or the error that prevented it.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<Value, EvalError> {
        let start = Instant::now();
        let root_digest = self.graph.digest(self.root);
        let reachable = self.graph.reachable(self.root);
        tracing::info!("Evaluating {} ({} nodes)", root_digest.short(), reachable.len());
        self.emit(|execution_id| ExecutionEvent::EvaluationStarted {
            execution_id,
            root: root_digest,
            nodes: reachable.len(),
            timestamp: Utc::now(),
        });

        self.register(&reachable);
        let result = self.drive(&cancel).await;

        let duration_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::info!("Evaluation of {} completed in {}ms", root_digest.short(), duration_ms),
            Err(e) => tracing::error!("Evaluation of {} failed after {}ms: {}", root_digest.short(), duration_ms, e),
        }
        let success = result.is_ok();
        self.emit(|execution_id| ExecutionEvent::EvaluationCompleted {
            execution_id,
            success,
            duration_ms,
            timestamp: Utc::now(),
        });
        result
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<Value, EvalError> {
        let mut released = self.pool.subscribe();
        loop {
            if cancel.is_cancelled() && !self.cancelled {
                self.cancel();
            }
            if !self.stopping {
                self.process_ready();
                self.admit();
            }

            let root_state = self.entry(self.root).state;
            match root_state {
                NodeState::Done => {
                    return Ok(self.entry(self.root).value.clone().unwrap_or(Value::Unit));
                }
                NodeState::Error if !self.cancelled => {
                    let err = self
                        .entry(self.root)
                        .error
                        .clone()
                        .unwrap_or_else(|| EvalError::Cancelled("root failed".to_string()));
                    match self.config.on_error {
                        ErrorHandling::Abort => {
                            self.work.cancel();
                            self.drop_queue(&err);
                            self.detach_running();
                            return Err(err);
                        }
                        ErrorHandling::Drain if !self.stopping => {
                            tracing::info!("Draining {} in-flight task(s) after failure", self.running.len());
                            self.stopping = true;
                            self.drop_queue(&err);
                        }
                        _ => {}
                    }
                    if self.running.is_empty() && (self.stopping || (self.ready.is_empty() && self.queue.is_empty())) {
                        return Err(err);
                    }
                }
                _ => {}
            }

            if self.running.is_empty() {
                if self.cancelled {
                    return Err(EvalError::Cancelled("evaluation cancelled".to_string()));
                }
                if self.queue.is_empty() && self.ready.is_empty() {
                    return Err(GraphError::Invalid(format!(
                        "evaluation of {} made no progress",
                        self.graph.digest(self.root).short()
                    ))
                    .into());
                }
            }

            let waiting_for_capacity = !self.stopping && !self.queue.is_empty();
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !self.cancelled => {}
                Some(first) = self.running.next(), if !self.running.is_empty() => {
                    let mut batch = vec![first];
                    while let Some(Some(next)) = self.running.next().now_or_never() {
                        batch.push(next);
                    }
                    // Completions that arrive together commit in a reproducible order.
                    batch.sort_by_key(|(id, _)| self.graph.digest(*id));
                    for (id, result) in batch {
                        self.complete_task(id, result);
                    }
                }
                changed = released.changed(), if waiting_for_capacity => {
                    if changed.is_err() {
                        return Err(EvalError::Cancelled("executor pool closed".to_string()));
                    }
                }
                else => {}
            }
        }
    }

    /// Stop watching in-flight tasks. Their results, and any claims they hold,
    /// are dropped as they finish.
    fn detach_running(&mut self) {
        if !self.running.is_empty() {
            tracing::debug!("Detaching {} in-flight task(s)", self.running.len());
        }
        self.running = FuturesUnordered::new();
    }

    /// Add entries for `ids`, which must be in dependency-first order.
    fn register(&mut self, ids: &[NodeId]) -> usize {
        let mut added = 0;
        for &id in ids {
            if self.entries.contains_key(&id) {
                continue;
            }
            let mut entry = Entry::new();
            let deps = self.graph.node(id).deps().to_vec();
            for dep in deps {
                let dep_entry = self.entry_mut(dep);
                match dep_entry.state {
                    NodeState::Done => {}
                    NodeState::Error => {
                        if entry.error.is_none() {
                            entry.error = dep_entry.error.clone();
                        }
                    }
                    _ => {
                        entry.pending += 1;
                        dep_entry.dependents.push(id);
                    }
                }
            }
            if entry.error.is_some() {
                entry.state = NodeState::Error;
            } else if entry.pending == 0 {
                self.ready.push_back(id);
            }
            self.entries.insert(id, entry);
            self.publish(id);
            added += 1;
        }
        added
    }

    fn process_ready(&mut self) {
        while let Some(id) = self.ready.pop_front() {
            let entry = self.entry(id);
            let resumable = entry.state == NodeState::Running && entry.spliced.is_some();
            if entry.state == NodeState::Init || resumable {
                self.start(id);
            }
        }
    }

    fn start(&mut self, id: NodeId) {
        let node = self.graph.node(id).clone();
        let digest = node.digest();
        {
            let entry = self.entry_mut(id);
            if let Some(root) = entry.spliced {
                let outcome = self.resolved(root);
                return self.commit(id, outcome, None);
            }
            entry.started = Some(Instant::now());
        }
        let deps: Vec<Value> = node
            .deps()
            .iter()
            .map(|dep| self.entry(*dep).value.clone().unwrap_or(Value::Unit))
            .collect();
        match node.op() {
            Op::K(k) => self.apply_continuation(id, k.as_ref(), &deps),
            Op::Map(m) => self.apply_mapper(id, m.as_ref(), digest, &deps),
            op if op.is_dispatched() => self.claim(id, op, digest, &deps),
            op => {
                let outcome = ops::eval_pure(op, digest, &deps);
                self.commit(id, outcome, None);
            }
        }
    }

    fn resolved(&self, id: NodeId) -> Outcome {
        let entry = self.entry(id);
        match (&entry.value, &entry.error) {
            (Some(v), _) => Ok(v.clone()),
            (None, Some(e)) => Err(e.clone()),
            (None, None) => Err(EvalError::Cancelled(format!("{} has no result", id))),
        }
    }

    fn claim(&mut self, id: NodeId, op: &Op, digest: Digest, deps: &[Value]) {
        let config = match ops::exec_config(op, digest, deps) {
            Ok(config) => config,
            Err(e) => return self.commit(id, Err(e), None),
        };
        self.set_state(id, NodeState::Running);
        if !op.is_cacheable() {
            return self.enqueue(id, digest, config, None);
        }
        match self.cache.claim(digest) {
            Claim::Done(value) => {
                tracing::debug!("Memoized result for {} {}", op.name(), digest.short());
                if let Some(events) = &self.events {
                    events.cache_hit(id, digest);
                }
                self.commit(id, Ok(value), None);
            }
            Claim::Wait(handle) => {
                tracing::debug!("Waiting for another claimant of {}", digest.short());
                let work = self.work.clone();
                self.spawn(id, digest, async move {
                    tokio::select! {
                        outcome = handle.wait() => TaskResult::Shared(outcome),
                        _ = work.cancelled() => TaskResult::Abandoned,
                    }
                });
            }
            Claim::Owner(guard) => {
                let cache = Arc::clone(&self.cache);
                self.spawn(id, digest, async move {
                    match cache.lookup_durable(&digest).await {
                        Some(value) => {
                            guard.complete(Ok(value.clone()));
                            TaskResult::Hit(value)
                        }
                        None => TaskResult::Miss { guard, config },
                    }
                });
            }
        }
    }

    fn enqueue(&mut self, id: NodeId, digest: Digest, config: ExecConfig, guard: Option<ClaimGuard>) {
        let resources = config.resources();
        self.queue.push(Queued {
            id,
            digest,
            resources,
            config,
            guard,
            seq: self.seq,
        });
        self.seq += 1;
    }

    /// Offer queued work to the pool, in scheduling order.
    fn admit(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let mut queue = std::mem::take(&mut self.queue);
        if self.config.scheduling == SchedulingPolicy::LargestFirst {
            queue.sort_by(|a, b| {
                b.resources
                    .weight()
                    .cmp(&a.resources.weight())
                    .then(a.seq.cmp(&b.seq))
            });
        }
        let mut waiting = Vec::new();
        for queued in queue {
            if self.config.max_parallel.filter(|max| *max > 0).map_or(false, |max| self.dispatching >= max) {
                waiting.push(queued);
                continue;
            }
            match self.pool.try_reserve(queued.resources) {
                Admission::Reserved(reservation) => self.dispatch(queued, reservation),
                Admission::Busy => waiting.push(queued),
                Admission::Never { largest } => {
                    let err = EvalError::Resources {
                        digest: queued.digest,
                        required: queued.resources,
                        largest,
                    };
                    if let Some(guard) = queued.guard {
                        guard.complete(Err(err.clone()));
                    }
                    self.commit(queued.id, Err(err), None);
                }
            }
        }
        if !waiting.is_empty() {
            tracing::debug!("{} node(s) waiting for executor capacity", waiting.len());
        }
        self.queue = waiting;
    }

    fn dispatch(&mut self, queued: Queued, reservation: Reservation) {
        let Queued {
            id,
            digest,
            config,
            guard,
            ..
        } = queued;
        let executor = reservation.executor_name().to_string();
        self.entry_mut(id).executor = Some(executor);
        self.publish(id);
        self.dispatching += 1;
        let task = Dispatch {
            id,
            digest,
            op: self.graph.node(id).op().name(),
            config,
            guard,
            reservation,
            pool: Arc::clone(&self.pool),
            cache: Arc::clone(&self.cache),
            retry: self.config.retry.clone(),
            rotate: self.config.rotate_executors,
            events: self.events.clone(),
            cancel: self.work.clone(),
        };
        self.spawn(id, digest, async move { TaskResult::Dispatched(task.run().await) });
    }

    fn spawn<F>(&mut self, id: NodeId, digest: Digest, task: F)
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.running.push(
            async move {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) => TaskResult::Failed(EvalError::Executor {
                        digest,
                        attempts: 0,
                        message: format!("task failed: {}", e),
                    }),
                };
                (id, result)
            }
            .boxed(),
        );
    }

    fn complete_task(&mut self, id: NodeId, result: TaskResult) {
        let digest = self.graph.digest(id);
        match result {
            TaskResult::Hit(value) => {
                tracing::debug!("Cache hit for {}", digest.short());
                if let Some(events) = &self.events {
                    events.cache_hit(id, digest);
                }
                self.commit(id, Ok(value), None);
            }
            TaskResult::Shared(Err(e)) if e.is_cancelled() && !self.stopping => {
                // The other claimant gave up; claim it again ourselves.
                tracing::debug!("Claim on {} was abandoned elsewhere, reclaiming", digest.short());
                self.set_state(id, NodeState::Init);
                self.ready.push_back(id);
            }
            TaskResult::Shared(outcome) => self.commit(id, outcome, None),
            TaskResult::Miss { guard, config } => {
                if self.stopping {
                    drop(guard);
                    self.commit(id, Err(EvalError::Cancelled("evaluation stopped".to_string())), None);
                } else {
                    self.enqueue(id, digest, config, Some(guard));
                }
            }
            TaskResult::Dispatched(done) => {
                self.dispatching = self.dispatching.saturating_sub(1);
                if done.attempts > 1 && done.outcome.is_ok() {
                    tracing::info!("Exec {} succeeded after {} attempts", digest.short(), done.attempts);
                }
                self.commit(id, done.outcome, Some(done.executor));
            }
            TaskResult::Abandoned => {
                self.commit(id, Err(EvalError::Cancelled("evaluation cancelled".to_string())), None);
            }
            TaskResult::Failed(e) => self.commit(id, Err(e), None),
        }
    }

    fn commit(&mut self, id: NodeId, outcome: Outcome, executor: Option<String>) {
        if self.entry(id).state.is_terminal() {
            return;
        }
        let value = match outcome {
            Ok(value) => value,
            Err(e) => return self.fail(id, e),
        };
        let node = self.graph.node(id);
        let digest = node.digest();
        let op = node.op().name();
        let dispatched = node.op().is_dispatched();
        let entry = self.entry_mut(id);
        let duration_ms = entry.started.map_or(0, |s| s.elapsed().as_millis() as u64);
        entry.state = NodeState::Done;
        entry.value = Some(value);
        if executor.is_some() {
            entry.executor = executor;
        }
        let dependents = std::mem::take(&mut entry.dependents);
        if dispatched {
            tracing::info!("Node {} ({} {}) completed in {}ms", id, op, digest.short(), duration_ms);
        } else {
            tracing::debug!("Node {} ({}) done", id, op);
        }
        if let Some(events) = &self.events {
            events.completed(id, digest, duration_ms);
        }
        self.publish(id);

        for dependent in dependents {
            let entry = self.entry_mut(dependent);
            entry.pending = entry.pending.saturating_sub(1);
            let resumable = entry.state == NodeState::Running && entry.spliced.is_some();
            if entry.pending == 0 && (entry.state == NodeState::Init || resumable) {
                self.ready.push_back(dependent);
            }
        }
    }

    /// Mark `id` and everything depending on it as failed.
    fn fail(&mut self, id: NodeId, err: EvalError) {
        if err.is_cancelled() {
            tracing::debug!("Node {} cancelled: {}", id, err);
        } else {
            tracing::error!("Node {} failed: {}", id, err);
        }
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let digest = self.graph.digest(current);
            let entry = self.entry_mut(current);
            if entry.state.is_terminal() {
                continue;
            }
            entry.state = NodeState::Error;
            entry.error = Some(err.clone());
            stack.extend(std::mem::take(&mut entry.dependents));
            if let Some(events) = &self.events {
                events.failed(current, digest, err.to_string());
            }
            self.publish(current);
        }
    }

    fn apply_continuation(&mut self, id: NodeId, k: &dyn Continuation, deps: &[Value]) {
        tracing::debug!("Applying continuation {} at {}", k.name(), id);
        match k.apply(deps, &mut self.graph) {
            Ok(root) => self.splice(id, root),
            Err(e) => self.commit(id, Err(e.into()), None),
        }
    }

    fn apply_mapper(&mut self, id: NodeId, m: &dyn Mapper, digest: Digest, deps: &[Value]) {
        let items: Vec<Value> = match deps.first() {
            Some(Value::List(items)) => items.clone(),
            Some(Value::Dir(entries)) => entries.values().map(|f| Value::File(*f)).collect(),
            Some(other) => {
                let err = EvalError::type_error(digest, format!("cannot map over {}", other.kind()));
                return self.commit(id, Err(err), None);
            }
            None => {
                let err = EvalError::type_error(digest, "map without input");
                return self.commit(id, Err(err), None);
            }
        };
        tracing::debug!("Mapping {} over {} item(s) at {}", m.name(), items.len(), id);
        let mut roots = Vec::with_capacity(items.len());
        for item in &items {
            match m.apply(item, &mut self.graph) {
                Ok(root) => roots.push(root),
                Err(e) => return self.commit(id, Err(e.into()), None),
            }
        }
        match self.graph.list(roots) {
            Ok(root) => self.splice(id, root),
            Err(e) => self.commit(id, Err(e.into()), None),
        }
    }

    /// Make `id` wait on `root`, registering whatever part of `root`'s
    /// subgraph is new to this evaluation.
    fn splice(&mut self, id: NodeId, root: NodeId) {
        if self.graph.get(root).is_none() {
            return self.commit(id, Err(GraphError::NodeNotFound(root.to_string()).into()), None);
        }
        if self.graph.depends_on(root, id) {
            return self.commit(id, Err(GraphError::CyclicDependency.into()), None);
        }
        let reachable = self.graph.reachable(root);
        let added = self.register(&reachable);
        tracing::debug!("Spliced {} node(s) under {}", added, id);
        if let Some(events) = &self.events {
            events.spliced(id, added);
        }

        let entry = self.entry_mut(id);
        entry.spliced = Some(root);
        entry.state = NodeState::Running;
        self.publish(id);
        let root_state = self.entry(root).state;
        match root_state {
            NodeState::Done | NodeState::Error => self.ready.push_back(id),
            _ => {
                self.entry_mut(root).dependents.push(id);
                self.entry_mut(id).pending = 1;
            }
        }
    }

    /// User cancellation.
    fn cancel(&mut self) {
        tracing::info!(
            "Evaluation cancelled ({:?}); {} task(s) in flight",
            self.config.cancel,
            self.running.len()
        );
        self.cancelled = true;
        self.stopping = true;
        if self.config.cancel == CancelMode::Immediate {
            self.work.cancel();
        }
        self.drop_queue(&EvalError::Cancelled("evaluation cancelled".to_string()));
    }

    /// Give up on queued work, releasing its claims.
    fn drop_queue(&mut self, cause: &EvalError) {
        let reason = EvalError::Cancelled(format!("not dispatched: {}", cause));
        for queued in std::mem::take(&mut self.queue) {
            drop(queued.guard);
            self.commit(queued.id, Err(reason.clone()), None);
        }
    }

    fn set_state(&mut self, id: NodeId, state: NodeState) {
        self.entry_mut(id).state = state;
        self.publish(id);
    }

    fn publish(&self, id: NodeId) {
        let entry = self.entry(id);
        let node = self.graph.node(id);
        self.board.set(NodeStatus {
            id,
            digest: node.digest(),
            op: node.op().name().to_string(),
            state: entry.state,
            executor: entry.executor.clone(),
            error: entry.error.as_ref().map(|e| e.to_string()),
        });
    }

    fn emit(&self, event: impl FnOnce(flowcore::ExecutionId) -> ExecutionEvent) {
        if let Some(events) = &self.events {
            events.emit(event(events.execution_id()));
        }
    }

    // Every id handed to these is registered before use.
    fn entry(&self, id: NodeId) -> &Entry {
        &self.entries[&id]
    }

    fn entry_mut(&mut self, id: NodeId) -> &mut Entry {
        self.entries.entry(id).or_insert_with(Entry::new)
    }
}
