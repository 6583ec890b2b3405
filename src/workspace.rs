use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::scheduler::job::JobId;

/// Allocates and reclaims the per-job working directories under one root.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir_for(&self, job_id: &JobId) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    /// Create the job's directory. Fails if it already exists.
    pub async fn allocate(&self, job_id: &JobId) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.root).await?;
        let dir = self.dir_for(job_id);
        tokio::fs::create_dir(&dir).await?;
        tracing::debug!(job_id = %job_id, dir = %dir.display(), "Allocated working directory");
        Ok(dir)
    }

    /// Remove a directory tree. A directory that is already gone is fine.
    pub async fn reclaim(&self, dir: &Path) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {
                tracing::debug!(dir = %dir.display(), "Reclaimed working directory");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
