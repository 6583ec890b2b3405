use std::collections::{HashMap, HashSet};

use crate::error::{Result, SchedulerError};
use crate::scheduler::job::{Job, JobId, JobKindTag, JobState, StateChange};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Registry of every live job plus the ids of deleted ones.
#[derive(Debug)]
pub struct JobStore {
    jobs: HashMap<JobId, Job>,
    retired: HashSet<JobId>,
    next_seq: u64,
    max_jobs: usize,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            retired: HashSet::new(),
            next_seq: 0,
            max_jobs,
        }
    }

    /// Hand out an id that has never been used in this store.
    pub fn allocate_id(&self) -> JobId {
        loop {
            let id = JobId::new();
            if !self.jobs.contains_key(&id) && !self.retired.contains(&id) {
                return id;
            }
        }
    }

    /// Submission sequence number for the next job.
    pub fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Add a job. Fails if the store is at capacity or the id was ever used.
    pub fn insert(&mut self, job: Job) -> Result<()> {
        if self.is_full() {
            return Err(SchedulerError::AtCapacity);
        }
        if self.jobs.contains_key(&job.id) || self.retired.contains(&job.id) {
            return Err(SchedulerError::validation(format!(
                "job id {} is already in use",
                job.id
            )));
        }
        self.jobs.insert(job.id, job);
        Ok(())
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn was_deleted(&self, id: &JobId) -> bool {
        self.retired.contains(id)
    }

    pub fn state_of(&self, id: &JobId) -> Option<JobState> {
        self.jobs.get(id).map(|j| j.state)
    }

    /// Apply a state transition to a stored job.
    pub fn transition(
        &mut self,
        id: &JobId,
        next: JobState,
        error: Option<String>,
    ) -> Result<(JobState, StateChange)> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or(SchedulerError::JobNotFound(*id))?;
        let from = job.state;
        let change = job.transition(next, error)?;
        Ok((from, change))
    }

    /// Remove a job and retire its id.
    pub fn remove(&mut self, id: &JobId) -> Option<Job> {
        let job = self.jobs.remove(id)?;
        self.retired.insert(*id);
        Some(job)
    }

    /// All jobs in submission order
    pub fn all_jobs(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.seq);
        jobs
    }

    /// Jobs of one kind in submission order
    pub fn jobs_of_kind(&self, kind: JobKindTag) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self
            .jobs
            .values()
            .filter(|j| j.kind_tag() == kind)
            .collect();
        jobs.sort_by_key(|j| j.seq);
        jobs
    }

    pub fn jobs_in_state(&self, state: JobState) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().filter(|j| j.state == state).collect();
        jobs.sort_by_key(|j| j.seq);
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }
}
