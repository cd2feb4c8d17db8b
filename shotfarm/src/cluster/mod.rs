//! Worker pool management
//!
//! - `pool`: the [`WorkerPool`] trait and the in-process [`LocalPool`]
//! - `orchestrator`: pool lifecycle and resource tagging
//! - `stats`: task counters

pub mod orchestrator;
pub mod pool;
pub mod stats;

pub use orchestrator::ClusterOrchestrator;
pub use pool::{BroadcastHandle, LocalPool, ResourceTag, TaskFuture, WorkerPool, PROCESS_RESOURCE};
pub use stats::TaskStats;
