use thiserror::Error;

use crate::scheduler::job::{JobId, JobState};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Job {job_id} is still referenced by {} dependent job(s)", dependents.len())]
    Conflict {
        job_id: JobId,
        dependents: Vec<JobId>,
    },

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job store is at capacity")]
    AtCapacity,

    #[error("Scheduler is not running")]
    Stopped,

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchedulerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SchedulerError::Validation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
