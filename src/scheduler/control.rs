use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{PrerequisitePolicy, SchedulerConfig};
use crate::error::{Result, SchedulerError};
use crate::scheduler::deps::DependencyResolver;
use crate::scheduler::job::{Job, JobId, JobKind, JobKindTag, JobState, NewJob};
use crate::scheduler::pool::DispatchPool;
use crate::scheduler::store::JobStore;
use crate::worker::runner::{run_job, ExecutionContext, ExecutionError, JobRunner, Prerequisite};
use crate::workspace::Workspace;

/// Requests into the control loop
#[derive(Debug)]
pub enum SchedulerMessage {
    Submit {
        job: NewJob,
        response_tx: oneshot::Sender<Result<JobId>>,
    },
    Abort {
        job_id: JobId,
        response_tx: oneshot::Sender<Result<()>>,
    },
    Delete {
        job_id: JobId,
        response_tx: oneshot::Sender<Result<()>>,
    },
    /// Drain executions and hand the loop state back
    Stop,
}

impl SchedulerMessage {
    fn reject(self, err: fn() -> SchedulerError) {
        match self {
            SchedulerMessage::Submit { response_tx, .. } => {
                let _ = response_tx.send(Err(err()));
            }
            SchedulerMessage::Abort { response_tx, .. }
            | SchedulerMessage::Delete { response_tx, .. } => {
                let _ = response_tx.send(Err(err()));
            }
            SchedulerMessage::Stop => {}
        }
    }
}

/// Notifications from executions back into the loop
#[derive(Debug)]
pub enum ExecutionReport {
    Finished {
        job_id: JobId,
        result: std::result::Result<(), ExecutionError>,
    },
    /// The abort grace period of a cancelled execution ran out
    AbortDeadline { job_id: JobId },
}

/// A committed state transition
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub kind: JobKindTag,
    pub from: JobState,
    pub to: JobState,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct Execution {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    aborting: bool,
    /// Set when the job was deleted while its execution was still alive
    detached_dir: Option<PathBuf>,
}

/// The single writer of job state.
///
/// All registry changes, dependency evaluations and delete admissions happen
/// on this task, so "is there a dependent" can never race a dependency
/// finishing or a concurrent delete.
pub struct ControlLoop {
    config: SchedulerConfig,
    store: Arc<RwLock<JobStore>>,
    resolver: DependencyResolver,
    pool: DispatchPool,
    executions: HashMap<JobId, Execution>,
    runner: Arc<dyn JobRunner>,
    workspace: Workspace,
    events: broadcast::Sender<JobEvent>,
    message_rx: mpsc::Receiver<SchedulerMessage>,
    report_tx: mpsc::Sender<ExecutionReport>,
    report_rx: mpsc::Receiver<ExecutionReport>,
    draining: bool,
}

impl ControlLoop {
    pub fn new(
        config: SchedulerConfig,
        runner: Arc<dyn JobRunner>,
        store: Arc<RwLock<JobStore>>,
        events: broadcast::Sender<JobEvent>,
    ) -> (Self, mpsc::Sender<SchedulerMessage>) {
        let (message_tx, message_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (report_tx, report_rx) = mpsc::channel(config.channel_capacity.max(1));

        let control = Self {
            pool: DispatchPool::new(config.max_running),
            workspace: Workspace::new(config.jobs_dir.clone()),
            config,
            store,
            resolver: DependencyResolver::new(),
            executions: HashMap::new(),
            runner,
            events,
            message_rx,
            report_tx,
            report_rx,
            draining: false,
        };

        (control, message_tx)
    }

    /// Run until a `Stop` arrives or every sender is gone, then drain and
    /// return the loop so it can be started again.
    pub async fn run(mut self) -> Self {
        tracing::info!(
            max_running = self.pool.max_running(),
            jobs_dir = %self.workspace.root().display(),
            "Scheduler control loop started"
        );

        // Jobs queued before a previous stop
        self.dispatch_ready().await;

        loop {
            tokio::select! {
                msg = self.message_rx.recv() => {
                    match msg {
                        Some(SchedulerMessage::Stop) | None => break,
                        Some(msg) => self.handle_message(msg).await,
                    }
                }
                Some(report) = self.report_rx.recv() => {
                    self.handle_report(report).await;
                }
            }
        }

        self.drain().await;
        tracing::info!("Scheduler control loop stopped");
        self
    }

    async fn handle_message(&mut self, msg: SchedulerMessage) {
        match msg {
            SchedulerMessage::Submit { job, response_tx } => {
                let result = self.submit(job).await;
                let _ = response_tx.send(result);
            }
            SchedulerMessage::Abort {
                job_id,
                response_tx,
            } => {
                let result = self.abort(job_id).await;
                let _ = response_tx.send(result);
            }
            SchedulerMessage::Delete {
                job_id,
                response_tx,
            } => {
                let result = self.delete(job_id).await;
                let _ = response_tx.send(result);
            }
            SchedulerMessage::Stop => {}
        }
    }

    async fn handle_report(&mut self, report: ExecutionReport) {
        match report {
            ExecutionReport::Finished { job_id, result } => {
                self.execution_finished(job_id, result).await
            }
            ExecutionReport::AbortDeadline { job_id } => self.abort_deadline(job_id).await,
        }
    }

    /// Commit one transition and publish it. Returns false if the state
    /// machine rejected it.
    fn commit(
        &self,
        store: &mut JobStore,
        job_id: &JobId,
        to: JobState,
        error: Option<String>,
    ) -> bool {
        match store.transition(job_id, to, error) {
            Ok((from, change)) => {
                let (kind, error) = store
                    .get(job_id)
                    .map(|j| (j.kind_tag(), j.error.clone()))
                    .unwrap_or((JobKindTag::Dataset, None));
                match &error {
                    Some(err) if to == JobState::Error => {
                        tracing::warn!(job_id = %job_id, %kind, from = %from, to = %to, error = %err, "Job state changed")
                    }
                    _ => tracing::info!(job_id = %job_id, %kind, from = %from, to = %to, "Job state changed"),
                }
                let _ = self.events.send(JobEvent {
                    job_id: *job_id,
                    kind,
                    from,
                    to,
                    at: change.at,
                    error: if to == JobState::Error { error } else { None },
                });
                true
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Rejected state transition");
                false
            }
        }
    }

    async fn submit(&mut self, job: NewJob) -> Result<JobId> {
        let store_lock = Arc::clone(&self.store);

        let job_id = {
            let store = store_lock.read().await;
            if store.is_full() {
                return Err(SchedulerError::AtCapacity);
            }
            for dep in &job.depends_on {
                DependencyResolver::validate_prerequisite(&store, &job.kind, dep)?;
            }
            store.allocate_id()
        };

        let work_dir = self.workspace.allocate(&job_id).await?;

        let mut store = store_lock.write().await;
        let seq = store.next_seq();
        let kind_tag = job.kind.tag();
        if let Err(e) = store.insert(Job::new(job_id, seq, job.name, job.kind, work_dir.clone())) {
            drop(store);
            self.reclaim(&work_dir).await;
            return Err(e);
        }

        for dep in &job.depends_on {
            if let Err(e) = self.resolver.declare(&mut store, job_id, *dep) {
                self.resolver.forget(&mut store, &job_id);
                store.remove(&job_id);
                drop(store);
                self.reclaim(&work_dir).await;
                return Err(e);
            }
        }

        tracing::info!(
            job_id = %job_id,
            kind = %kind_tag,
            dependencies = job.depends_on.len(),
            "Job submitted"
        );

        if DependencyResolver::is_satisfied(&store, &job_id) {
            self.admit(&mut store, job_id, seq);
        } else {
            self.commit(&mut store, &job_id, JobState::Waiting, None);
            self.resolver.register_interest(&store, job_id);

            let failed = DependencyResolver::failed_prerequisites(&store, &job_id);
            if !failed.is_empty() && self.config.prerequisite_policy == PrerequisitePolicy::Cascade
            {
                tracing::info!(job_id = %job_id, failed = ?failed, "Prerequisite already failed, aborting dependent");
                self.resolver.withdraw_interest(&job_id);
                self.commit(&mut store, &job_id, JobState::Abort, None);
            }
        }
        drop(store);

        self.dispatch_ready().await;
        Ok(job_id)
    }

    /// Commit `Running` for a job whose dependencies are met and queue its
    /// execution. The pool decides when the execution actually starts.
    fn admit(&mut self, store: &mut JobStore, job_id: JobId, seq: u64) {
        if self.commit(store, &job_id, JobState::Running, None) {
            self.pool.enqueue(seq, job_id);
        }
    }

    async fn abort(&mut self, job_id: JobId) -> Result<()> {
        let store_lock = Arc::clone(&self.store);
        let mut store = store_lock.write().await;

        let state = store
            .state_of(&job_id)
            .ok_or(SchedulerError::JobNotFound(job_id))?;

        match state {
            JobState::Done | JobState::Abort | JobState::Error => {
                tracing::debug!(job_id = %job_id, state = %state, "Abort on finished job ignored");
            }
            // Only seen inside submit, which runs on this same loop
            JobState::Initialized => {
                tracing::debug!(job_id = %job_id, "Abort on unadmitted job ignored");
            }
            JobState::Waiting => {
                self.resolver.withdraw_interest(&job_id);
                self.commit(&mut store, &job_id, JobState::Abort, None);
                self.prerequisite_ended(&mut store, job_id);
            }
            JobState::Running if self.pool.dequeue(&job_id) => {
                tracing::debug!(job_id = %job_id, "Aborting job before its execution started");
                self.commit(&mut store, &job_id, JobState::Abort, None);
                self.prerequisite_ended(&mut store, job_id);
            }
            JobState::Running => match self.executions.get_mut(&job_id) {
                Some(execution) => {
                    if !execution.aborting {
                        execution.aborting = true;
                        execution.cancel.cancel();
                        tracing::info!(job_id = %job_id, "Cancellation requested");
                        self.schedule_abort_deadline(job_id);
                    }
                }
                None => {
                    self.pool.release(&job_id);
                    self.commit(&mut store, &job_id, JobState::Abort, None);
                    self.prerequisite_ended(&mut store, job_id);
                }
            },
        }
        Ok(())
    }

    async fn delete(&mut self, job_id: JobId) -> Result<()> {
        let store_lock = Arc::clone(&self.store);
        let mut store = store_lock.write().await;

        let Some(job) = store.get(&job_id) else {
            return Err(SchedulerError::JobNotFound(job_id));
        };
        if DependencyResolver::has_dependents(&store, &job_id) {
            let dependents = job.dependents.iter().copied().collect();
            tracing::info!(job_id = %job_id, "Delete refused, job has dependents");
            return Err(SchedulerError::Conflict { job_id, dependents });
        }

        self.pool.dequeue(&job_id);
        self.resolver.forget(&mut store, &job_id);
        let Some(job) = store.remove(&job_id) else {
            return Err(SchedulerError::JobNotFound(job_id));
        };
        drop(store);

        if let Some(execution) = self.executions.get_mut(&job_id) {
            tracing::info!(job_id = %job_id, "Detaching execution of deleted job");
            execution.detached_dir = Some(job.work_dir.clone());
            if !execution.aborting {
                execution.aborting = true;
                execution.cancel.cancel();
                self.schedule_abort_deadline(job_id);
            }
        }

        self.reclaim(&job.work_dir).await;
        tracing::info!(job_id = %job_id, state = %job.state, "Job deleted");
        Ok(())
    }

    async fn reclaim(&self, dir: &std::path::Path) {
        if let Err(e) = self.workspace.reclaim(dir).await {
            tracing::warn!(dir = %dir.display(), error = %e, "Failed to reclaim working directory");
        }
    }

    /// Start the executions of admitted jobs while there is capacity.
    async fn dispatch_ready(&mut self) {
        if self.draining {
            return;
        }

        let store_lock = Arc::clone(&self.store);
        let store = store_lock.read().await;

        while let Some(job_id) = self.pool.next_dispatchable() {
            let Some(job) = store.get(&job_id).filter(|j| j.state == JobState::Running) else {
                self.pool.release(&job_id);
                continue;
            };

            let ctx = ExecutionContext {
                job_id,
                work_dir: job.work_dir.clone(),
                prerequisites: job
                    .dependencies
                    .iter()
                    .filter_map(|dep| store.get(dep))
                    .map(|p| Prerequisite {
                        id: p.id,
                        kind: p.kind_tag(),
                        work_dir: p.work_dir.clone(),
                    })
                    .collect(),
            };
            let kind = job.kind.clone();
            self.spawn_execution(job_id, kind, ctx);
        }
    }

    fn spawn_execution(&mut self, job_id: JobId, kind: JobKind, ctx: ExecutionContext) {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let runner = Arc::clone(&self.runner);
        let report_tx = self.report_tx.clone();

        let handle = tokio::spawn(async move {
            let result = AssertUnwindSafe(run_job(runner.as_ref(), &kind, &ctx, &task_cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(ExecutionError::Failed("execution panicked".to_string())));

            if report_tx
                .send(ExecutionReport::Finished { job_id, result })
                .await
                .is_err()
            {
                tracing::debug!(job_id = %job_id, "Control loop gone, dropping execution report");
            }
        });

        self.executions.insert(
            job_id,
            Execution {
                cancel,
                handle,
                aborting: false,
                detached_dir: None,
            },
        );
    }

    fn schedule_abort_deadline(&self, job_id: JobId) {
        let report_tx = self.report_tx.clone();
        let grace = self.config.abort_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = report_tx
                .send(ExecutionReport::AbortDeadline { job_id })
                .await;
        });
    }

    async fn execution_finished(
        &mut self,
        job_id: JobId,
        result: std::result::Result<(), ExecutionError>,
    ) {
        // Already forced to Abort after the grace period
        let Some(execution) = self.executions.remove(&job_id) else {
            return;
        };
        self.pool.release(&job_id);

        if let Some(dir) = execution.detached_dir {
            tracing::debug!(job_id = %job_id, "Detached execution finished");
            self.reclaim(&dir).await;
            self.dispatch_ready().await;
            return;
        }

        let store_lock = Arc::clone(&self.store);
        let mut store = store_lock.write().await;

        if execution.aborting || matches!(result, Err(ExecutionError::Cancelled)) {
            self.commit(&mut store, &job_id, JobState::Abort, None);
            self.prerequisite_ended(&mut store, job_id);
        } else {
            match result {
                Ok(()) => {
                    if self.commit(&mut store, &job_id, JobState::Done, None) {
                        for ready in self.resolver.on_dependency_resolved(&store, &job_id) {
                            if let Some(seq) = store.get(&ready).map(|j| j.seq) {
                                tracing::debug!(job_id = %ready, prerequisite = %job_id, "Dependencies satisfied");
                                self.admit(&mut store, ready, seq);
                            }
                        }
                    }
                }
                Err(e) => {
                    self.commit(&mut store, &job_id, JobState::Error, Some(e.to_string()));
                    self.prerequisite_ended(&mut store, job_id);
                }
            }
        }
        drop(store);

        self.dispatch_ready().await;
    }

    async fn abort_deadline(&mut self, job_id: JobId) {
        match self.executions.get(&job_id) {
            Some(execution) if execution.aborting => {}
            _ => return,
        }
        let Some(execution) = self.executions.remove(&job_id) else {
            return;
        };

        tracing::warn!(
            job_id = %job_id,
            grace_ms = self.config.abort_grace_ms,
            "Execution did not acknowledge cancellation, terminating"
        );
        self.force_abort(job_id, execution).await;
        self.dispatch_ready().await;
    }

    async fn force_abort(&mut self, job_id: JobId, execution: Execution) {
        execution.handle.abort();
        self.pool.release(&job_id);

        if let Some(dir) = execution.detached_dir {
            self.reclaim(&dir).await;
            return;
        }

        let store_lock = Arc::clone(&self.store);
        let mut store = store_lock.write().await;
        if store.state_of(&job_id) == Some(JobState::Running) {
            self.commit(&mut store, &job_id, JobState::Abort, None);
            self.prerequisite_ended(&mut store, job_id);
        }
    }

    /// A prerequisite ended in `Error` or `Abort`; apply the configured policy
    /// to the dependents still waiting on it.
    fn prerequisite_ended(&mut self, store: &mut JobStore, job_id: JobId) {
        let mut pending = vec![job_id];
        while let Some(failed) = pending.pop() {
            for dependent in self.resolver.waiting_dependents(store, &failed) {
                match self.config.prerequisite_policy {
                    PrerequisitePolicy::Wait => {
                        tracing::warn!(
                            job_id = %dependent,
                            prerequisite = %failed,
                            "Prerequisite failed, dependent stays waiting"
                        );
                    }
                    PrerequisitePolicy::Cascade => {
                        self.resolver.withdraw_interest(&dependent);
                        self.pool.dequeue(&dependent);
                        if self.commit(store, &dependent, JobState::Abort, None) {
                            pending.push(dependent);
                        }
                    }
                }
            }
        }
    }

    /// Cancel every execution, wait up to the grace period for them to
    /// acknowledge, force the rest, then refuse whatever is still queued.
    async fn drain(&mut self) {
        self.draining = true;

        if !self.executions.is_empty() {
            tracing::info!(count = self.executions.len(), "Draining in-flight executions");
            for execution in self.executions.values_mut() {
                if !execution.aborting {
                    execution.aborting = true;
                    execution.cancel.cancel();
                }
            }

            let deadline = Instant::now() + self.config.abort_grace();
            while !self.executions.is_empty() {
                match tokio::time::timeout_at(deadline, self.report_rx.recv()).await {
                    Ok(Some(ExecutionReport::Finished { job_id, result })) => {
                        self.execution_finished(job_id, result).await;
                    }
                    Ok(Some(ExecutionReport::AbortDeadline { .. })) => {}
                    Ok(None) | Err(_) => break,
                }
            }

            let remaining: Vec<JobId> = self.executions.keys().copied().collect();
            for job_id in remaining {
                if let Some(execution) = self.executions.remove(&job_id) {
                    tracing::warn!(job_id = %job_id, "Execution did not stop in time, terminating");
                    self.force_abort(job_id, execution).await;
                }
            }
        }

        while let Ok(msg) = self.message_rx.try_recv() {
            msg.reject(|| SchedulerError::Stopped);
        }

        self.draining = false;
    }
}
