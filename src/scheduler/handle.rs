use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::control::{ControlLoop, JobEvent, SchedulerMessage};
use crate::scheduler::job::{Job, JobId, JobKindTag, JobState, NewJob};
use crate::scheduler::store::JobStore;
use crate::worker::JobRunner;

const EVENT_CAPACITY: usize = 256;

enum LoopSlot {
    Idle(ControlLoop),
    Active(JoinHandle<ControlLoop>),
    /// The loop task panicked; its state is lost
    Failed,
}

/// Per-state job counts
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerSummary {
    pub running: bool,
    pub total: usize,
    pub by_state: BTreeMap<String, usize>,
}

/// Handle to the scheduler. Build one at startup and share it.
///
/// Mutations are forwarded to the control loop and answered through a
/// oneshot channel. Reads go straight to the shared store and return
/// copies of the committed state.
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<RwLock<JobStore>>,
    message_tx: mpsc::Sender<SchedulerMessage>,
    events: broadcast::Sender<JobEvent>,
    running: AtomicBool,
    slot: Mutex<LoopSlot>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, runner: Arc<dyn JobRunner>) -> Self {
        let store = Arc::new(RwLock::new(JobStore::with_capacity(config.max_jobs)));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (control, message_tx) =
            ControlLoop::new(config.clone(), runner, Arc::clone(&store), events.clone());

        Self {
            config,
            store,
            message_tx,
            events,
            running: AtomicBool::new(false),
            slot: Mutex::new(LoopSlot::Idle(control)),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Start the control loop. Calling it again while running is a no-op.
    /// Returns whether the loop is up.
    pub async fn start(&self) -> bool {
        let mut slot = self.slot.lock().await;
        match std::mem::replace(&mut *slot, LoopSlot::Failed) {
            LoopSlot::Idle(control) => {
                *slot = LoopSlot::Active(tokio::spawn(control.run()));
                self.running.store(true, Ordering::SeqCst);
                true
            }
            LoopSlot::Active(handle) => {
                let alive = !handle.is_finished();
                *slot = LoopSlot::Active(handle);
                alive
            }
            LoopSlot::Failed => {
                tracing::error!("Scheduler control loop failed earlier and cannot be restarted");
                false
            }
        }
    }

    /// Stop the control loop, draining in-flight executions. Jobs are kept
    /// and the scheduler can be started again.
    pub async fn stop(&self) {
        let mut slot = self.slot.lock().await;
        let handle = match std::mem::replace(&mut *slot, LoopSlot::Failed) {
            LoopSlot::Active(handle) => handle,
            other => {
                *slot = other;
                return;
            }
        };

        self.running.store(false, Ordering::SeqCst);
        if self.message_tx.send(SchedulerMessage::Stop).await.is_err() {
            tracing::warn!("Control loop receiver already closed");
        }

        match handle.await {
            Ok(control) => *slot = LoopSlot::Idle(control),
            Err(e) => tracing::error!(error = %e, "Scheduler control loop terminated abnormally"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> SchedulerMessage,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        {
            // stop() holds the slot while it drains, so a request either
            // lands ahead of the Stop message or sees the scheduler stopped
            let _slot = self.slot.lock().await;
            if !self.is_running() {
                return Err(SchedulerError::Stopped);
            }
            self.message_tx
                .send(build(response_tx))
                .await
                .map_err(|_| SchedulerError::Stopped)?;
        }
        response_rx.await.map_err(|_| SchedulerError::Stopped)?
    }

    /// Create a job. Parameters are checked here; dependency references are
    /// checked by the control loop. On error nothing is created.
    pub async fn submit(&self, job: NewJob) -> Result<JobId> {
        // Validation walks caller-supplied folders
        let job = tokio::task::spawn_blocking(move || job.validate().map(|()| job))
            .await
            .map_err(std::io::Error::other)??;
        self.request(|response_tx| SchedulerMessage::Submit { job, response_tx })
            .await
    }

    /// Request cancellation. Acknowledged immediately; a running job reaches
    /// `Abort` once its execution stops or the grace period ends.
    pub async fn abort(&self, job_id: JobId) -> Result<()> {
        self.request(|response_tx| SchedulerMessage::Abort {
            job_id,
            response_tx,
        })
        .await
    }

    /// Remove a job and its working directory unless other jobs depend on it.
    pub async fn delete(&self, job_id: JobId) -> Result<()> {
        self.request(|response_tx| SchedulerMessage::Delete {
            job_id,
            response_tx,
        })
        .await
    }

    pub async fn status(&self, job_id: &JobId) -> Result<JobState> {
        self.store
            .read()
            .await
            .state_of(job_id)
            .ok_or(SchedulerError::JobNotFound(*job_id))
    }

    pub async fn get(&self, job_id: &JobId) -> Result<Job> {
        self.store
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or(SchedulerError::JobNotFound(*job_id))
    }

    /// Jobs in submission order, optionally of one kind only.
    pub async fn list(&self, kind: Option<JobKindTag>) -> Vec<Job> {
        let store = self.store.read().await;
        let jobs = match kind {
            Some(kind) => store.jobs_of_kind(kind),
            None => store.all_jobs(),
        };
        jobs.into_iter().cloned().collect()
    }

    pub async fn summary(&self) -> SchedulerSummary {
        let store = self.store.read().await;
        let mut by_state = BTreeMap::new();
        for job in store.all_jobs() {
            *by_state.entry(job.state.to_string()).or_insert(0) += 1;
        }
        SchedulerSummary {
            running: self.is_running(),
            total: store.len(),
            by_state,
        }
    }

    /// Committed transitions, in commit order.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }
}
