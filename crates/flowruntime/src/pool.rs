//! Resource-aware admission of work to a set of executors.
//!
//! The pool tracks, per executor, the sum of resources held by outstanding
//! [`Reservation`]s and never lets it exceed the executor's declared
//! capacity. Releasing a reservation bumps a generation counter so that
//! schedulers waiting for capacity can retry without polling.

use flowcore::{Executor, Resources};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

struct Slot {
    executor: Arc<dyn Executor>,
    capacity: Resources,
}

/// Result of an admission attempt.
pub enum Admission {
    Reserved(Reservation),
    /// Fits some executor's capacity, but not right now.
    Busy,
    /// Larger than every executor in the pool.
    Never { largest: Resources },
}

/// A pool of executors shared by any number of evaluations.
pub struct ExecutorPool {
    slots: Vec<Slot>,
    used: Mutex<Vec<Resources>>,
    released: watch::Sender<u64>,
}

impl ExecutorPool {
    pub fn new(executors: Vec<Arc<dyn Executor>>) -> Arc<Self> {
        let slots: Vec<Slot> = executors
            .into_iter()
            .map(|executor| {
                let capacity = executor.resources();
                tracing::info!("Adding executor {} with capacity {}", executor.name(), capacity);
                Slot { executor, capacity }
            })
            .collect();
        let used = vec![Resources::ZERO; slots.len()];
        let (released, _) = watch::channel(0);
        Arc::new(Self {
            slots,
            used: Mutex::new(used),
            released,
        })
    }

    pub fn single(executor: Arc<dyn Executor>) -> Arc<Self> {
        Self::new(vec![executor])
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn executors(&self) -> impl Iterator<Item = &Arc<dyn Executor>> {
        self.slots.iter().map(|s| &s.executor)
    }

    /// Resources currently reserved on executor `index`.
    pub fn in_use(&self, index: usize) -> Resources {
        self.lock_used().get(index).copied().unwrap_or_default()
    }

    /// Capacity of the largest executor, component-wise.
    pub fn largest(&self) -> Resources {
        self.slots.iter().fold(Resources::ZERO, |acc, s| Resources {
            cpu: acc.cpu.max(s.capacity.cpu),
            memory: acc.memory.max(s.capacity.memory),
            disk: acc.disk.max(s.capacity.disk),
        })
    }

    /// Whether some single executor could ever run work of this size.
    pub fn can_ever_fit(&self, resources: &Resources) -> bool {
        self.slots.iter().any(|s| resources.fits_within(&s.capacity))
    }

    /// Receiver that changes whenever capacity is released.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.released.subscribe()
    }

    /// Reserve `resources` on the best-fitting executor with spare capacity.
    pub fn try_reserve(self: &Arc<Self>, resources: Resources) -> Admission {
        self.reserve_excluding(resources, None)
    }

    /// Like [`try_reserve`](Self::try_reserve) but never picks executor `exclude`.
    pub fn try_reserve_other(self: &Arc<Self>, resources: Resources, exclude: usize) -> Admission {
        self.reserve_excluding(resources, Some(exclude))
    }

    fn reserve_excluding(self: &Arc<Self>, resources: Resources, exclude: Option<usize>) -> Admission {
        if !self.can_ever_fit(&resources) {
            return Admission::Never {
                largest: self.largest(),
            };
        }
        let mut used = self.lock_used();
        let mut best: Option<(usize, Resources)> = None;
        for (index, slot) in self.slots.iter().enumerate() {
            if Some(index) == exclude {
                continue;
            }
            let available = slot.capacity - used[index];
            if !resources.fits_within(&available) {
                continue;
            }
            // Best fit: leave the least memory behind, to limit fragmentation.
            let left = available - resources;
            if best.map_or(true, |(_, b)| left.weight() < b.weight()) {
                best = Some((index, left));
            }
        }
        match best {
            Some((index, _)) => {
                used[index] += resources;
                tracing::debug!(
                    "Reserved {} on {} (in use {})",
                    resources,
                    self.slots[index].executor.name(),
                    used[index]
                );
                Admission::Reserved(Reservation {
                    pool: Arc::clone(self),
                    index,
                    resources,
                })
            }
            None => Admission::Busy,
        }
    }

    fn release(&self, index: usize, resources: Resources) {
        {
            let mut used = self.lock_used();
            used[index] -= resources;
        }
        self.released.send_modify(|generation| *generation += 1);
    }

    fn lock_used(&self) -> std::sync::MutexGuard<'_, Vec<Resources>> {
        // The guarded data is plain counters, valid even after a panic elsewhere.
        self.used.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Capacity held on one executor; released on drop.
pub struct Reservation {
    pool: Arc<ExecutorPool>,
    index: usize,
    resources: Resources,
}

impl Reservation {
    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.pool.slots[self.index].executor
    }

    pub fn executor_name(&self) -> &str {
        self.executor().name()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn resources(&self) -> Resources {
        self.resources
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.pool.release(self.index, self.resources);
    }
}
