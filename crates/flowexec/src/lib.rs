//! Local collaborators for the flow runtime
//!
//! Repositories and assocs held in memory or on disk, an executor that runs
//! work as local processes (directly or in docker), and the built-in
//! `exec_each` mapper.

mod each;
mod files;
mod fs;
mod intern;
mod local;
mod memory;

pub use each::{ExecEach, ExecEachFactory};
pub use fs::{FileAssoc, FileRepository};
pub use local::{ExecMode, LocalExec, LocalExecutor};
pub use memory::{MemoryAssoc, MemoryRepository};

use flowruntime::ContinuationRegistry;
use std::sync::Arc;

/// Register the built-in continuations and mappers
pub fn register_all(registry: &mut ContinuationRegistry) {
    registry.register_mapper(Arc::new(ExecEachFactory));
}
