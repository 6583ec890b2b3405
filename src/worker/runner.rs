use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::scheduler::job::{DatasetParams, JobId, JobKind, JobKindTag, ModelParams};

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("execution cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A finished prerequisite as seen by the job consuming it.
#[derive(Debug, Clone)]
pub struct Prerequisite {
    pub id: JobId,
    pub kind: JobKindTag,
    pub work_dir: PathBuf,
}

/// Everything an execution may touch. Executions never see the store.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: JobId,
    pub work_dir: PathBuf,
    pub prerequisites: Vec<Prerequisite>,
}

impl ExecutionContext {
    /// Working directory of the dataset a model trains on.
    pub fn dataset_dir(&self) -> Option<&Path> {
        self.prerequisites
            .iter()
            .find(|p| p.kind == JobKindTag::Dataset)
            .map(|p| p.work_dir.as_path())
    }
}

/// The execution collaborator: dataset ingestion and model training.
///
/// Implementations should return [`ExecutionError::Cancelled`] soon after
/// `cancel` fires. One that does not is terminated after the scheduler's
/// abort grace period.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn prepare_dataset(
        &self,
        ctx: &ExecutionContext,
        params: &DatasetParams,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionError>;

    async fn train_model(
        &self,
        ctx: &ExecutionContext,
        params: &ModelParams,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionError>;
}

/// Start the kind-specific execution for a job.
pub async fn run_job(
    runner: &dyn JobRunner,
    kind: &JobKind,
    ctx: &ExecutionContext,
    cancel: &CancellationToken,
) -> Result<(), ExecutionError> {
    if cancel.is_cancelled() {
        return Err(ExecutionError::Cancelled);
    }
    match kind {
        JobKind::Dataset(params) => runner.prepare_dataset(ctx, params, cancel).await,
        JobKind::Model(params) => runner.train_model(ctx, params, cancel).await,
    }
}
