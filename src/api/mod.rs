//! HTTP binding of the scheduler's control interface.
//!
//! Creation answers `303 See Other` with a `Location` header pointing at the
//! new job. Lookups of unknown ids answer 404, a refused delete answers 403
//! and unusable creation input answers 400.

mod error;
mod types;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post, MethodRouter},
    Json, Router,
};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::scheduler::{Job, JobId, JobKindTag, NewJob, Scheduler};

pub use error::ApiError;
pub use types::{
    AckResponse, CreateDatasetRequest, CreateJobResponse, CreateModelRequest, JobResponse,
    StatusResponse,
};

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
}

impl ApiState {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let jobs = job_routes("jobs", None, get(|s: State<ApiState>| list_jobs(s, None)));
    let datasets = job_routes(
        "datasets",
        Some(JobKindTag::Dataset),
        get(|s: State<ApiState>| list_jobs(s, Some(JobKindTag::Dataset))).post(create_dataset),
    );
    let models = job_routes(
        "models",
        Some(JobKindTag::Model),
        get(|s: State<ApiState>| list_jobs(s, Some(JobKindTag::Model))).post(create_model),
    );

    Router::new()
        .merge(jobs)
        .merge(datasets)
        .merge(models)
        .route("/api/summary", get(summary_handler))
        .route("/api/events", get(events_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Collection route plus the per-job routes under `/{prefix}`. A scoped
/// prefix hides jobs of the other kind.
fn job_routes(
    prefix: &str,
    scope: Option<JobKindTag>,
    collection: MethodRouter<ApiState>,
) -> Router<ApiState> {
    Router::new()
        .route(&format!("/{}", prefix), collection)
        .route(
            &format!("/{}/{{id}}", prefix),
            get(move |s: State<ApiState>, p: Path<String>| get_job(s, p, scope))
                .delete(move |s: State<ApiState>, p: Path<String>| delete_job(s, p, scope)),
        )
        .route(
            &format!("/{}/{{id}}/status", prefix),
            get(move |s: State<ApiState>, p: Path<String>| job_status(s, p, scope)),
        )
        .route(
            &format!("/{}/{{id}}/abort", prefix),
            post(move |s: State<ApiState>, p: Path<String>| abort_job(s, p, scope)),
        )
}

pub async fn run_api(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting HTTP API");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Resolve a path id to a job id visible under `scope`.
async fn resolve(
    state: &ApiState,
    raw_id: &str,
    scope: Option<JobKindTag>,
) -> Result<Job, ApiError> {
    let job_id: JobId = raw_id
        .parse()
        .map_err(|_| ApiError::not_found(format!("Job not found: {}", raw_id)))?;
    let job = state.scheduler.get(&job_id).await?;
    match scope {
        Some(kind) if job.kind_tag() != kind => {
            Err(ApiError::not_found(format!("{} not found: {}", kind, raw_id)))
        }
        _ => Ok(job),
    }
}

fn created(prefix: &str, job_id: JobId) -> impl IntoResponse {
    (
        StatusCode::SEE_OTHER,
        [(header::LOCATION, format!("/{}/{}", prefix, job_id))],
        Json(CreateJobResponse {
            job_id: job_id.to_string(),
        }),
    )
}

async fn create_dataset(
    State(state): State<ApiState>,
    payload: Result<Json<CreateDatasetRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) = payload?;
    let job = NewJob::dataset(payload.dataset_name, payload.params);
    let job_id = state.scheduler.submit(job).await?;
    Ok(created("datasets", job_id))
}

async fn create_model(
    State(state): State<ApiState>,
    payload: Result<Json<CreateModelRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(payload) = payload?;
    let job = NewJob::model(payload.model_name, payload.params);
    let job_id = state.scheduler.submit(job).await?;
    Ok(created("models", job_id))
}

async fn list_jobs(State(state): State<ApiState>, kind: Option<JobKindTag>) -> impl IntoResponse {
    let jobs: Vec<JobResponse> = state
        .scheduler
        .list(kind)
        .await
        .iter()
        .map(JobResponse::from)
        .collect();
    Json(jobs)
}

async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    scope: Option<JobKindTag>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = resolve(&state, &id, scope).await?;
    Ok(Json(JobResponse::from(&job)))
}

async fn job_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    scope: Option<JobKindTag>,
) -> Result<Json<StatusResponse>, ApiError> {
    let job = resolve(&state, &id, scope).await?;
    Ok(Json(StatusResponse {
        status: job.state.to_string(),
        error: job.error,
    }))
}

async fn abort_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    scope: Option<JobKindTag>,
) -> Result<Json<AckResponse>, ApiError> {
    let job = resolve(&state, &id, scope).await?;
    state.scheduler.abort(job.id).await?;
    Ok(Json(AckResponse::ok(job.id)))
}

async fn delete_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    scope: Option<JobKindTag>,
) -> Result<Json<AckResponse>, ApiError> {
    let job = resolve(&state, &id, scope).await?;
    state.scheduler.delete(job.id).await?;
    Ok(Json(AckResponse::ok(job.id)))
}

async fn summary_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.scheduler.summary().await)
}

async fn events_handler(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.scheduler.subscribe()).filter_map(|event| match event {
        Ok(event) => Event::default()
            .event("transition")
            .json_data(&event)
            .ok()
            .map(Ok),
        Err(e) => {
            tracing::warn!(error = %e, "Event subscriber lagged");
            None
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
