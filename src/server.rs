use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::{run_api, ApiState};
use crate::config::ServerConfig;
use crate::scheduler::Scheduler;
use crate::worker::{CommandRunner, JobRunner};

/// Wires the scheduler, its runner and the HTTP API together.
pub struct Server {
    pub config: ServerConfig,
    pub scheduler: Arc<Scheduler>,
}

impl Server {
    /// Build a server that executes jobs with a [`CommandRunner`].
    pub fn new(config: ServerConfig) -> Self {
        let runner = Arc::new(CommandRunner::new(config.runner.clone()));
        Self::with_runner(config, runner)
    }

    pub fn with_runner(config: ServerConfig, runner: Arc<dyn JobRunner>) -> Self {
        let scheduler = Arc::new(Scheduler::new(config.scheduler.clone(), runner));
        Self { config, scheduler }
    }

    /// Run until `shutdown` fires.
    ///
    /// 1. Starts the scheduler control loop
    /// 2. Serves the HTTP API until shutdown
    /// 3. Stops the scheduler, draining in-flight executions
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler does not come up or the listener
    /// cannot be bound.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
        if !self.scheduler.start().await {
            return Err("scheduler wouldn't start".into());
        }

        let state = ApiState::new(Arc::clone(&self.scheduler));
        let served = run_api(self.config.listen_addr, state, shutdown.clone()).await;

        // The API may have failed on its own; stop everything either way
        shutdown.cancel();
        self.scheduler.stop().await;
        served?;
        Ok(())
    }
}
