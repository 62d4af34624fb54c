//! Flow graph evaluation runtime
//!
//! This crate evaluates [`flowcore::FlowGraph`]s: it schedules ready nodes,
//! deduplicates work through a shared cache coordinator, admits execs to a
//! pool of executors by resource fit, and splices the subgraphs produced by
//! continuations.

mod cache;
mod config;
mod dispatch;
mod eval;
mod loader;
mod ops;
mod pool;
mod registry;
mod runtime;

pub use cache::{CacheCoordinator, Claim, ClaimGuard, Outcome, ResultCache, WaitHandle};
pub use config::{CancelMode, ErrorHandling, EvalConfig, RetryPolicy, SchedulingPolicy};
pub use eval::{Eval, StatusBoard};
pub use loader::GraphLoader;
pub use ops::eval_pure;
pub use pool::{Admission, ExecutorPool, Reservation};
pub use registry::{
    ContinuationFactory, ContinuationRegistry, FactoryKind, FactoryMetadata, MapperFactory,
    ParamDefinition,
};
pub use runtime::{FlowRuntime, RuntimeConfig};
