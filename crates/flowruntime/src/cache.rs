//! Result caching and at-most-once coordination.
//!
//! [`CacheCoordinator`] is shared by every evaluation that should share
//! work. Claims are keyed by node digest; the first claimant computes and
//! everyone else waits for the same outcome. Successful outcomes are
//! memoized in process and, when a [`ResultCache`] is configured, persisted
//! so later runs find them too.

use crate::config::RetryPolicy;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use flowcore::{Assoc, Digest, EvalError, Repository, RepositoryError, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

pub type Outcome = Result<Value, EvalError>;

/// Retry `op` while it fails with a transient repository error.
pub(crate) async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, RepositoryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RepositoryError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!("{} failed (attempt {}): {}; retrying in {:?}", what, attempt, e, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Durable results: serialized values stored in a repository, indexed by an assoc.
#[derive(Clone)]
pub struct ResultCache {
    repository: Arc<dyn Repository>,
    assoc: Arc<dyn Assoc>,
    retry: RetryPolicy,
}

impl ResultCache {
    pub fn new(repository: Arc<dyn Repository>, assoc: Arc<dyn Assoc>) -> Self {
        Self {
            repository,
            assoc,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    /// Cached value for `key`. A value is only returned if it decodes and
    /// every file it references is present.
    pub async fn lookup(&self, key: &Digest) -> Result<Option<Value>, RepositoryError> {
        let value_id = match retry_transient(&self.retry, "assoc get", || self.assoc.get(key)).await? {
            Some(id) => id,
            None => return Ok(None),
        };
        let bytes = match retry_transient(&self.retry, "repository get", || self.repository.get(&value_id)).await {
            Ok(bytes) => bytes,
            Err(RepositoryError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let value: Value = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Discarding undecodable cache entry {}: {}", key.short(), e);
                return Ok(None);
            }
        };
        for file in value.files() {
            let present = retry_transient(&self.retry, "repository stat", || self.repository.contains(&file.id)).await?;
            if !present {
                tracing::debug!("Cache entry {} references missing object {}", key.short(), file.id.short());
                return Ok(None);
            }
        }
        Ok(Some(value))
    }

    pub async fn store(&self, key: Digest, value: &Value) -> Result<(), RepositoryError> {
        let bytes = Bytes::from(serde_json::to_vec(value).map_err(|e| RepositoryError::Io(e.to_string()))?);
        let value_id = retry_transient(&self.retry, "repository put", || self.repository.put(bytes.clone())).await?;
        retry_transient(&self.retry, "assoc put", || self.assoc.put(key, value_id)).await
    }
}

/// Outcome of [`CacheCoordinator::claim`].
pub enum Claim {
    /// Already computed in this process.
    Done(Value),
    /// The caller is the sole computer of this digest.
    Owner(ClaimGuard),
    /// Someone else is computing it.
    Wait(WaitHandle),
}

pub struct CacheCoordinator {
    memo: DashMap<Digest, Value>,
    inflight: Mutex<HashMap<Digest, watch::Receiver<Option<Outcome>>>>,
    touched: DashSet<Digest>,
    results: Option<ResultCache>,
}

impl CacheCoordinator {
    /// Coordinator with in-process memoization only.
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// Coordinator backed by a durable result cache.
    pub fn with_results(results: ResultCache) -> Arc<Self> {
        Self::build(Some(results))
    }

    fn build(results: Option<ResultCache>) -> Arc<Self> {
        Arc::new(Self {
            memo: DashMap::new(),
            inflight: Mutex::new(HashMap::new()),
            touched: DashSet::new(),
            results,
        })
    }

    pub fn results(&self) -> Option<&ResultCache> {
        self.results.as_ref()
    }

    /// Repository holding cached results, if any.
    pub fn repository(&self) -> Option<&Arc<dyn Repository>> {
        self.results.as_ref().map(|r| r.repository())
    }

    /// Every digest that has been claimed or looked up.
    pub fn digests(&self) -> Vec<Digest> {
        let mut all: Vec<Digest> = self.touched.iter().map(|d| *d).collect();
        all.sort();
        all
    }

    /// Find a value without claiming: in-process memo first, then the
    /// durable cache. Repository failures degrade to a miss.
    pub async fn lookup(&self, digest: &Digest) -> Option<Value> {
        self.touched.insert(*digest);
        if let Some(v) = self.memo.get(digest) {
            return Some(v.clone());
        }
        self.lookup_durable(digest).await
    }

    pub(crate) async fn lookup_durable(&self, digest: &Digest) -> Option<Value> {
        let results = self.results.as_ref()?;
        match results.lookup(digest).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("Cache lookup for {} failed, treating as miss: {}", digest.short(), e);
                None
            }
        }
    }

    /// Persist a computed value. Failures are logged; the value is still valid.
    pub async fn store(&self, digest: Digest, value: &Value) {
        if let Some(results) = &self.results {
            if let Err(e) = results.store(digest, value).await {
                tracing::warn!("Failed to persist result {}: {}", digest.short(), e);
            }
        }
    }

    pub fn claim(self: &Arc<Self>, digest: Digest) -> Claim {
        self.touched.insert(digest);
        let mut inflight = self.lock_inflight();
        if let Some(v) = self.memo.get(&digest) {
            return Claim::Done(v.clone());
        }
        if let Some(rx) = inflight.get(&digest) {
            return Claim::Wait(WaitHandle { rx: rx.clone() });
        }
        let (tx, rx) = watch::channel(None);
        inflight.insert(digest, rx);
        Claim::Owner(ClaimGuard {
            coordinator: Arc::clone(self),
            digest,
            tx: Some(tx),
        })
    }

    /// Number of digests currently being computed.
    pub fn inflight(&self) -> usize {
        self.lock_inflight().len()
    }

    fn finish(&self, digest: Digest, tx: watch::Sender<Option<Outcome>>, outcome: Outcome) {
        {
            let mut inflight = self.lock_inflight();
            if let Ok(value) = &outcome {
                self.memo.insert(digest, value.clone());
            }
            inflight.remove(&digest);
        }
        let _ = tx.send(Some(outcome));
    }

    fn lock_inflight(&self) -> std::sync::MutexGuard<'_, HashMap<Digest, watch::Receiver<Option<Outcome>>>> {
        self.inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Exclusive right to compute a digest. Dropping it without calling
/// [`complete`](Self::complete) releases waiters with a cancellation.
pub struct ClaimGuard {
    coordinator: Arc<CacheCoordinator>,
    digest: Digest,
    tx: Option<watch::Sender<Option<Outcome>>>,
}

impl ClaimGuard {
    pub fn digest(&self) -> Digest {
        self.digest
    }

    /// Publish the outcome to every waiter.
    pub fn complete(mut self, outcome: Outcome) {
        if let Some(tx) = self.tx.take() {
            self.coordinator.finish(self.digest, tx, outcome);
        }
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            tracing::debug!("Claim on {} abandoned", self.digest.short());
            self.coordinator.finish(
                self.digest,
                tx,
                Err(EvalError::Cancelled(format!("claim on {} abandoned", self.digest.short()))),
            );
        }
    }
}

/// Handle on a computation owned by another caller.
pub struct WaitHandle {
    rx: watch::Receiver<Option<Outcome>>,
}

impl WaitHandle {
    pub async fn wait(mut self) -> Outcome {
        let outcome = match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| Err(EvalError::Cancelled("claim owner went away".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_is_exclusive_and_waiters_share_outcome() {
        let coordinator = CacheCoordinator::new();
        let d = Digest::of_bytes(b"work");
        let owner = match coordinator.claim(d) {
            Claim::Owner(g) => g,
            _ => panic!("first claim must own"),
        };
        let waiters: Vec<WaitHandle> = (0..3)
            .map(|_| match coordinator.claim(d) {
                Claim::Wait(h) => h,
                _ => panic!("later claims must wait"),
            })
            .collect();
        let joins: Vec<_> = waiters.into_iter().map(|h| tokio::spawn(h.wait())).collect();
        owner.complete(Ok(Value::Int(7)));
        for j in joins {
            assert_eq!(j.await.unwrap(), Ok(Value::Int(7)));
        }
        assert!(matches!(coordinator.claim(d), Claim::Done(Value::Int(7))));
        assert_eq!(coordinator.inflight(), 0);
    }

    #[tokio::test]
    async fn test_dropped_claim_releases_waiters_with_cancellation() {
        let coordinator = CacheCoordinator::new();
        let d = Digest::of_bytes(b"abandoned");
        let owner = match coordinator.claim(d) {
            Claim::Owner(g) => g,
            _ => panic!("first claim must own"),
        };
        let waiter = match coordinator.claim(d) {
            Claim::Wait(h) => h,
            _ => panic!("second claim must wait"),
        };
        drop(owner);
        let outcome = waiter.wait().await;
        assert!(outcome.unwrap_err().is_cancelled());
        // Failures are not memoized: the digest can be claimed again.
        assert!(matches!(coordinator.claim(d), Claim::Owner(_)));
    }

    #[tokio::test]
    async fn test_failure_propagates_to_waiters() {
        let coordinator = CacheCoordinator::new();
        let d = Digest::of_bytes(b"failing");
        let owner = match coordinator.claim(d) {
            Claim::Owner(g) => g,
            _ => panic!("first claim must own"),
        };
        let waiter = match coordinator.claim(d) {
            Claim::Wait(h) => h,
            _ => panic!("second claim must wait"),
        };
        let err = EvalError::Work {
            digest: d,
            exit_code: 1,
            message: "boom".to_string(),
        };
        owner.complete(Err(err.clone()));
        assert_eq!(waiter.wait().await, Err(err));
        assert_eq!(coordinator.digests(), vec![d]);
    }
}
