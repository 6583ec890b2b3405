//! Job execution.
//!
//! The scheduler never runs dataset ingestion or training itself. It hands
//! each dispatched job to a [`JobRunner`] on its own task:
//! - **[`JobRunner`]**: the execution seam, one method per job kind
//! - **[`CommandRunner`]**: runs a configured shell command per kind inside
//!   the job's working directory
//!
//! # Execution Flow
//!
//! 1. The control loop moves a job to `Running` and spawns its execution
//! 2. [`run_job`] calls the kind-specific runner method
//! 3. The runner watches its `CancellationToken` and returns
//!    [`ExecutionError::Cancelled`] when it fires
//! 4. The outcome is reported back to the control loop, which commits
//!    `Done`, `Error` or `Abort`

pub mod executor;
pub mod runner;

pub use executor::CommandRunner;
pub use runner::{run_job, ExecutionContext, ExecutionError, JobRunner, Prerequisite};
