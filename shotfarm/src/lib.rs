pub mod broadcast;
pub mod catalog;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod field;
pub mod observability;
pub mod optim;
pub mod partition;
pub mod reducer;
pub mod segy;
pub mod session;
pub mod solver;
pub mod store;
pub mod synthetic;
pub mod worker;

pub use broadcast::{IlluminationNormalizer, ModelSource, SharedContext, SharedStateBroadcaster};
pub use catalog::{ShotCatalog, ShotTask, TraceRef};
pub use cluster::{BroadcastHandle, ClusterOrchestrator, LocalPool, ResourceTag, WorkerPool};
pub use config::{ClusterConfig, ModelPreset, Precision, RunConfig, RunMode, SolverParams};
pub use errors::{FwiError, Result};
pub use field::Field;
pub use observability::{default_log_dir, init_production_logging, init_simple_logging};
pub use optim::{FinalModel, InversionDriver, Objective};
pub use partition::{partition, Partition};
pub use reducer::{GlobalResult, ResultReducer};
pub use session::{ForwardRun, ForwardSummary, InversionSession};
pub use store::{GridMetadata, ModelSlot};
pub use worker::{PartialResult, TaskOutput, WorkerTask};
