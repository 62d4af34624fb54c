//! Running one unit of work on an executor, with retries.

use crate::cache::{CacheCoordinator, ClaimGuard, Outcome};
use crate::config::RetryPolicy;
use crate::ops;
use crate::pool::{Admission, ExecutorPool, Reservation};
use flowcore::{
    transfer, Digest, EvalError, EventEmitter, ExecConfig, ExecResult, ExecutorError, NodeId,
    Value,
};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Everything a dispatch task needs; owned, so the task never touches the graph.
pub(crate) struct Dispatch {
    pub id: NodeId,
    pub digest: Digest,
    pub op: &'static str,
    pub config: ExecConfig,
    /// Absent for work whose result is not cached.
    pub guard: Option<ClaimGuard>,
    pub reservation: Reservation,
    pub pool: Arc<ExecutorPool>,
    pub cache: Arc<CacheCoordinator>,
    pub retry: RetryPolicy,
    pub rotate: bool,
    pub events: Option<EventEmitter>,
    pub cancel: CancellationToken,
}

/// Result of a dispatch, reported back to the evaluation loop.
pub(crate) struct Dispatched {
    pub outcome: Outcome,
    pub executor: String,
    pub attempts: u32,
    pub duration_ms: u64,
}

enum Attempt {
    Finished(ExecResult),
    Failed(ExecutorError),
    Cancelled,
}

impl Dispatch {
    pub async fn run(self) -> Dispatched {
        let Dispatch {
            id,
            digest,
            op,
            config,
            guard,
            mut reservation,
            pool,
            cache,
            retry,
            rotate,
            events,
            cancel,
        } = self;
        let start = Instant::now();
        let mut attempt = 1;
        let outcome = loop {
            let executor_name = reservation.executor_name().to_string();
            if let Some(events) = &events {
                events.dispatched(id, digest, op, &executor_name, attempt);
            }
            tracing::debug!("Dispatching {} {} to {} (attempt {})", op, digest.short(), executor_name, attempt);

            match run_once(&reservation, &cache, digest, &config, &cancel).await {
                Attempt::Finished(result) if result.is_success() => {
                    let outcome = finish(&reservation, &cache, digest, &config, result, attempt, guard.is_some()).await;
                    forget(&reservation, digest).await;
                    break outcome;
                }
                Attempt::Finished(result) => {
                    forget(&reservation, digest).await;
                    break Err(EvalError::Work {
                        digest,
                        exit_code: result.exit_code,
                        message: result.stderr.unwrap_or_default(),
                    });
                }
                Attempt::Cancelled => {
                    break Err(EvalError::Cancelled(format!("{} {} cancelled", op, digest.short())));
                }
                Attempt::Failed(e) if e.is_transient() && attempt < retry.max_attempts => {
                    let delay = retry.backoff(attempt);
                    tracing::warn!(
                        "Exec {} failed on {} (attempt {}): {}; retrying in {:?}",
                        digest.short(),
                        executor_name,
                        attempt,
                        e,
                        delay
                    );
                    if let Some(events) = &events {
                        events.retrying(id, digest, attempt, delay.as_millis() as u64, e.to_string());
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            break Err(EvalError::Cancelled(format!("{} {} cancelled", op, digest.short())));
                        }
                    }
                    if rotate && pool.len() > 1 {
                        if let Admission::Reserved(other) =
                            pool.try_reserve_other(reservation.resources(), reservation.index())
                        {
                            tracing::debug!("Rotating {} from {} to {}", digest.short(), executor_name, other.executor_name());
                            reservation = other;
                        }
                    }
                    attempt += 1;
                }
                Attempt::Failed(e) => {
                    break Err(EvalError::Executor {
                        digest,
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }
        };
        let executor = reservation.executor_name().to_string();
        if let Some(guard) = guard {
            guard.complete(outcome.clone());
        }
        drop(reservation);
        Dispatched {
            outcome,
            executor,
            attempts: attempt,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

async fn run_once(
    reservation: &Reservation,
    cache: &CacheCoordinator,
    digest: Digest,
    config: &ExecConfig,
    cancel: &CancellationToken,
) -> Attempt {
    let executor = Arc::clone(reservation.executor());
    if let Some(src) = cache.repository() {
        let dst = executor.repository();
        match transfer(&config.input_files(), src, &dst).await {
            Ok(0) => {}
            Ok(n) => tracing::debug!("Transferred {} input object(s) to {}", n, executor.name()),
            Err(e) => return Attempt::Failed(e.into()),
        }
    }
    let exec = match executor.put(digest, config.clone()).await {
        Ok(exec) => exec,
        Err(e) => return Attempt::Failed(e),
    };
    let result = tokio::select! {
        result = exec.wait() => result,
        _ = cancel.cancelled() => {
            if let Err(e) = executor.remove(digest).await {
                tracing::debug!("Failed to remove cancelled exec {}: {}", digest.short(), e);
            }
            return Attempt::Cancelled;
        }
    };
    match result {
        Ok(result) => Attempt::Finished(result),
        Err(e) => {
            // Resubmission is not idempotent; forget the failed exec first.
            forget(reservation, digest).await;
            Attempt::Failed(e)
        }
    }
}

/// Drops a finished exec from its executor so the next submission runs afresh.
async fn forget(reservation: &Reservation, digest: Digest) {
    if let Err(e) = reservation.executor().remove(digest).await {
        tracing::debug!("Failed to remove exec {} from {}: {}", digest.short(), reservation.executor_name(), e);
    }
}

async fn finish(
    reservation: &Reservation,
    cache: &CacheCoordinator,
    digest: Digest,
    config: &ExecConfig,
    result: ExecResult,
    attempts: u32,
    store: bool,
) -> Outcome {
    let value: Value = ops::exec_value(config, digest, result)?;
    if let Some(dst) = cache.repository() {
        let src = reservation.executor().repository();
        if let Err(e) = transfer(&value.files(), &src, dst).await {
            return Err(EvalError::Executor {
                digest,
                attempts,
                message: format!("failed to retrieve outputs: {}", e),
            });
        }
    }
    if store {
        cache.store(digest, &value).await;
    }
    Ok(value)
}
