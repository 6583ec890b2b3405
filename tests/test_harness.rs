//! Test harness for scheduler integration tests.
//!
//! Provides a scripted [`JobRunner`], labeled image folders and polling
//! helpers so tests never depend on real dataset or training tools.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use digits_lite::config::SchedulerConfig;
use digits_lite::scheduler::{
    DatasetParams, JobId, JobState, ModelParams, Network, NewJob, Scheduler,
};
use digits_lite::worker::{ExecutionContext, ExecutionError, JobRunner};

/// What a scripted execution does once started
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Succeed after the runner's delay
    Succeed,
    /// Fail with the given message after the runner's delay
    Fail(String),
    /// Block until [`ScriptedRunner::release`] hands out a permit
    Gated,
    /// Sleep for an hour and never look at the cancellation token
    IgnoreCancel,
    Panic,
}

/// A [`JobRunner`] whose outcome is chosen per job kind.
pub struct ScriptedRunner {
    dataset: Behavior,
    model: Behavior,
    delay: Duration,
    gate: Semaphore,
    started: Mutex<Vec<JobId>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedRunner {
    pub fn new(dataset: Behavior, model: Behavior) -> Self {
        Self {
            dataset,
            model,
            delay: Duration::from_millis(20),
            gate: Semaphore::new(0),
            started: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(Behavior::Succeed, Behavior::Succeed)
    }

    pub fn gated() -> Self {
        Self::new(Behavior::Gated, Behavior::Gated)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Let `n` gated executions finish.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Job ids in the order their executions started
    pub fn started(&self) -> Vec<JobId> {
        self.started.lock().unwrap().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        behavior: &Behavior,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionError> {
        self.started.lock().unwrap().push(ctx.job_id);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        tokio::fs::write(ctx.work_dir.join("output.log"), b"started\n").await?;

        match behavior {
            Behavior::Succeed => self.pause(cancel).await,
            Behavior::Fail(msg) => {
                self.pause(cancel).await?;
                Err(ExecutionError::Failed(msg.clone()))
            }
            Behavior::Gated => tokio::select! {
                permit = self.gate.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                    Ok(())
                }
                _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
            },
            Behavior::IgnoreCancel => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            Behavior::Panic => panic!("scripted runner panic"),
        }
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<(), ExecutionError> {
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => Ok(()),
            _ = cancel.cancelled() => Err(ExecutionError::Cancelled),
        }
    }
}

#[async_trait]
impl JobRunner for ScriptedRunner {
    async fn prepare_dataset(
        &self,
        ctx: &ExecutionContext,
        _params: &DatasetParams,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionError> {
        self.execute(ctx, &self.dataset, cancel).await
    }

    async fn train_model(
        &self,
        ctx: &ExecutionContext,
        _params: &ModelParams,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionError> {
        self.execute(ctx, &self.model, cancel).await
    }
}

/// Create `classes` label folders with `per_class` images each under `root`.
pub fn labeled_folder(root: &Path, classes: usize, per_class: usize) -> PathBuf {
    let folder = root.join("images");
    for class in 0..classes {
        let label = folder.join(format!("class_{}", class));
        std::fs::create_dir_all(&label).unwrap();
        for i in 0..per_class {
            std::fs::write(label.join(format!("img_{:02}.png", i)), b"\x89PNG").unwrap();
        }
    }
    folder
}

/// A running scheduler over a temporary jobs directory
pub struct TestScheduler {
    pub scheduler: Arc<Scheduler>,
    pub runner: Arc<ScriptedRunner>,
    pub images: PathBuf,
    pub jobs_dir: PathBuf,
    _tmp: TempDir,
}

impl TestScheduler {
    pub async fn start(runner: ScriptedRunner) -> Self {
        Self::start_with(runner, |cfg| cfg).await
    }

    /// Start with a config tweaked by `configure`. The abort grace period
    /// defaults to 200ms.
    pub async fn start_with(
        runner: ScriptedRunner,
        configure: impl FnOnce(SchedulerConfig) -> SchedulerConfig,
    ) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let images = labeled_folder(tmp.path(), 3, 10);
        let jobs_dir = tmp.path().join("jobs");
        let config = configure(SchedulerConfig::new(&jobs_dir).with_abort_grace_ms(200));

        let runner = Arc::new(runner);
        let scheduler = Arc::new(Scheduler::new(config, runner.clone()));
        assert!(scheduler.start().await);

        Self {
            scheduler,
            runner,
            images,
            jobs_dir,
            _tmp: tmp,
        }
    }

    pub fn dataset_job(&self, name: &str) -> NewJob {
        NewJob::dataset(name, DatasetParams::from_folder(&self.images))
    }

    pub fn model_job(&self, name: &str, dataset: JobId) -> NewJob {
        NewJob::model(
            name,
            ModelParams::new(
                dataset,
                Network::Standard {
                    name: "lenet".to_string(),
                },
            )
            .with_epochs(2),
        )
    }

    pub async fn submit_dataset(&self, name: &str) -> JobId {
        self.scheduler.submit(self.dataset_job(name)).await.unwrap()
    }

    pub async fn submit_model(&self, name: &str, dataset: JobId) -> JobId {
        self.scheduler
            .submit(self.model_job(name, dataset))
            .await
            .unwrap()
    }

    pub async fn wait_for_state(&self, job_id: &JobId, state: JobState) -> bool {
        wait_for_state(&self.scheduler, job_id, state, Duration::from_secs(5)).await
    }
}

/// Poll until `job_id` reaches `state` or `timeout` elapses.
pub async fn wait_for_state(
    scheduler: &Scheduler,
    job_id: &JobId,
    state: JobState,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if scheduler.status(job_id).await.ok() == Some(state) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Poll until `cond` holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
