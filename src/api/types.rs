use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::{DatasetParams, Job, JobId, JobKind, ModelParams};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDatasetRequest {
    pub dataset_name: String,
    #[serde(flatten)]
    pub params: DatasetParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateModelRequest {
    pub model_name: String,
    #[serde(flatten)]
    pub params: ModelParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobResponse {
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    pub job_id: String,
}

impl AckResponse {
    pub fn ok(job_id: JobId) -> Self {
        Self {
            success: true,
            job_id: job_id.to_string(),
        }
    }
}

/// Job descriptor as served to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub status: String,
    pub params: JobKind,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobResponse {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            name: job.name.clone(),
            kind: job.kind_tag().to_string(),
            status: job.state.to_string(),
            params: job.kind.clone(),
            dependencies: job.dependencies.iter().map(|id| id.to_string()).collect(),
            dependents: job.dependents.iter().map(|id| id.to_string()).collect(),
            error: job.error.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        }
    }
}
