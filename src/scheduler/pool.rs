use std::collections::{BTreeMap, HashMap, HashSet};

use crate::scheduler::job::JobId;

/// Bounded set of running jobs plus the FIFO queue of jobs whose
/// dependencies are met but that have no free slot yet.
#[derive(Debug)]
pub struct DispatchPool {
    max_running: usize,
    running: HashSet<JobId>,
    ready: BTreeMap<u64, JobId>,
    ready_seq: HashMap<JobId, u64>,
}

impl DispatchPool {
    pub fn new(max_running: usize) -> Self {
        Self {
            max_running: max_running.max(1),
            running: HashSet::new(),
            ready: BTreeMap::new(),
            ready_seq: HashMap::new(),
        }
    }

    /// Queue a satisfied job. `seq` is its submission number.
    pub fn enqueue(&mut self, seq: u64, job_id: JobId) {
        if self.running.contains(&job_id) || self.ready_seq.contains_key(&job_id) {
            return;
        }
        self.ready.insert(seq, job_id);
        self.ready_seq.insert(job_id, seq);
    }

    /// Take the oldest queued job if a slot is free, and count it as running.
    pub fn next_dispatchable(&mut self) -> Option<JobId> {
        if !self.has_capacity() {
            return None;
        }
        let (_, job_id) = self.ready.pop_first()?;
        self.ready_seq.remove(&job_id);
        self.running.insert(job_id);
        Some(job_id)
    }

    /// Drop a job from the ready queue. Returns true if it was queued.
    pub fn dequeue(&mut self, job_id: &JobId) -> bool {
        match self.ready_seq.remove(job_id) {
            Some(seq) => {
                self.ready.remove(&seq);
                true
            }
            None => false,
        }
    }

    /// Free the slot held by a job.
    pub fn release(&mut self, job_id: &JobId) -> bool {
        self.running.remove(job_id)
    }

    pub fn is_queued(&self, job_id: &JobId) -> bool {
        self.ready_seq.contains_key(job_id)
    }

    pub fn is_running(&self, job_id: &JobId) -> bool {
        self.running.contains(job_id)
    }

    pub fn has_capacity(&self) -> bool {
        self.running.len() < self.max_running
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.ready.len()
    }

    pub fn max_running(&self) -> usize {
        self.max_running
    }
}
