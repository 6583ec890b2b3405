use std::collections::{HashMap, HashSet};

use crate::error::{Result, SchedulerError};
use crate::scheduler::job::{JobId, JobKind, JobState};
use crate::scheduler::store::JobStore;

/// Tracks "A depends on B" edges and the jobs waiting on them.
///
/// Edges live on the jobs themselves (`dependencies` / `dependents`) so that
/// readers of the store see them. The resolver owns the wake interests: for
/// each waiting job, the prerequisites that have not reached `Done` yet.
#[derive(Debug, Default)]
pub struct DependencyResolver {
    unmet: HashMap<JobId, HashSet<JobId>>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a prerequisite for a job that is about to be created.
    pub fn validate_prerequisite(store: &JobStore, kind: &JobKind, dep: &JobId) -> Result<()> {
        if store.was_deleted(dep) {
            return Err(SchedulerError::validation(format!(
                "dependency {} has been deleted",
                dep
            )));
        }
        let prerequisite = store.get(dep).ok_or_else(|| {
            SchedulerError::validation(format!("dependency {} does not exist", dep))
        })?;

        if let Some(required) = kind.required_prerequisite() {
            if prerequisite.kind_tag() != required {
                return Err(SchedulerError::validation(format!(
                    "a {} job cannot depend on {} job {}",
                    kind.tag(),
                    prerequisite.kind_tag(),
                    dep
                )));
            }
        }
        Ok(())
    }

    /// Record the edge `job -> depends_on` on both ends.
    pub fn declare(&self, store: &mut JobStore, job: JobId, depends_on: JobId) -> Result<()> {
        if job == depends_on {
            return Err(SchedulerError::validation(format!(
                "job {} cannot depend on itself",
                job
            )));
        }
        if store.was_deleted(&depends_on) || !store.contains(&depends_on) {
            return Err(SchedulerError::validation(format!(
                "dependency {} does not exist",
                depends_on
            )));
        }
        if !store.contains(&job) {
            return Err(SchedulerError::JobNotFound(job));
        }
        if Self::reaches(store, depends_on, job) {
            return Err(SchedulerError::validation(format!(
                "dependency {} -> {} would create a cycle",
                job, depends_on
            )));
        }

        if let Some(prerequisite) = store.get_mut(&depends_on) {
            prerequisite.dependents.insert(job);
        }
        if let Some(dependent) = store.get_mut(&job) {
            dependent.dependencies.insert(depends_on);
        }
        Ok(())
    }

    /// Whether `to` is reachable from `from` by following dependency edges.
    fn reaches(store: &JobStore, from: JobId, to: JobId) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(job) = store.get(&id) {
                stack.extend(job.dependencies.iter().copied());
            }
        }
        false
    }

    pub fn is_satisfied(store: &JobStore, job: &JobId) -> bool {
        store.get(job).is_some_and(|j| {
            j.dependencies
                .iter()
                .all(|dep| store.state_of(dep) == Some(JobState::Done))
        })
    }

    /// Prerequisites of `job` that ended without reaching `Done`.
    pub fn failed_prerequisites(store: &JobStore, job: &JobId) -> Vec<JobId> {
        store
            .get(job)
            .map(|j| {
                j.dependencies
                    .iter()
                    .filter(|dep| store.state_of(dep).is_some_and(|s| s.is_failed()))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remember which prerequisites `job` still waits on.
    pub fn register_interest(&mut self, store: &JobStore, job: JobId) {
        let Some(j) = store.get(&job) else {
            return;
        };
        let unmet: HashSet<JobId> = j
            .dependencies
            .iter()
            .filter(|dep| store.state_of(dep) != Some(JobState::Done))
            .copied()
            .collect();
        if !unmet.is_empty() {
            tracing::debug!(job_id = %job, unmet = unmet.len(), "Waiting on dependencies");
            self.unmet.insert(job, unmet);
        }
    }

    pub fn withdraw_interest(&mut self, job: &JobId) {
        self.unmet.remove(job);
    }

    pub fn is_waiting(&self, job: &JobId) -> bool {
        self.unmet.contains_key(job)
    }

    /// Called once `dep` has committed `Done`. Returns the dependents whose
    /// last unmet prerequisite was `dep`, in submission order.
    pub fn on_dependency_resolved(&mut self, store: &JobStore, dep: &JobId) -> Vec<JobId> {
        let Some(prerequisite) = store.get(dep) else {
            return Vec::new();
        };

        let mut ready = Vec::new();
        for dependent in &prerequisite.dependents {
            let Some(unmet) = self.unmet.get_mut(dependent) else {
                continue;
            };
            unmet.remove(dep);
            if unmet.is_empty() {
                self.unmet.remove(dependent);
                ready.push(*dependent);
            }
        }
        ready.sort_by_key(|id| store.get(id).map(|j| j.seq).unwrap_or(u64::MAX));
        ready
    }

    /// Dependents of `dep` that are still waiting on it.
    pub fn waiting_dependents(&self, store: &JobStore, dep: &JobId) -> Vec<JobId> {
        store
            .get(dep)
            .map(|j| {
                j.dependents
                    .iter()
                    .filter(|id| self.unmet.get(id).is_some_and(|u| u.contains(dep)))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deletion guard: any reference blocks, whatever state the dependent is in.
    pub fn has_dependents(store: &JobStore, job: &JobId) -> bool {
        store.get(job).is_some_and(|j| !j.dependents.is_empty())
    }

    /// Drop every edge touching `job` ahead of its removal.
    pub fn forget(&mut self, store: &mut JobStore, job: &JobId) {
        self.unmet.remove(job);
        let dependencies: Vec<JobId> = store
            .get(job)
            .map(|j| j.dependencies.iter().copied().collect())
            .unwrap_or_default();
        for dep in dependencies {
            if let Some(prerequisite) = store.get_mut(&dep) {
                prerequisite.dependents.remove(job);
            }
        }
    }
}
