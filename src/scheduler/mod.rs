pub mod control;
pub mod deps;
pub mod handle;
pub mod job;
pub mod pool;
pub mod store;

pub use control::JobEvent;
pub use deps::DependencyResolver;
pub use handle::{Scheduler, SchedulerSummary};
pub use job::{
    DatasetParams, DatasetSource, Job, JobId, JobKind, JobKindTag, JobState, ModelParams,
    Network, NewJob,
};
pub use pool::DispatchPool;
pub use store::JobStore;
