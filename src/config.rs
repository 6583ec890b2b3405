use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// What happens to waiting dependents when a prerequisite ends in
/// `Error` or `Abort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrerequisitePolicy {
    /// Dependents stay `Waiting` until they are aborted or deleted.
    #[default]
    Wait,
    /// Dependents are moved to `Abort`.
    Cascade,
}

impl FromStr for PrerequisitePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wait" => Ok(PrerequisitePolicy::Wait),
            "cascade" => Ok(PrerequisitePolicy::Cascade),
            other => Err(format!(
                "unknown prerequisite policy '{}', expected 'wait' or 'cascade'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Root under which every job gets its own working directory
    pub jobs_dir: PathBuf,
    /// Maximum number of jobs executing at once (datasets and models share the pool)
    pub max_running: usize,
    /// Maximum number of jobs held in the store
    pub max_jobs: usize,
    /// How long a cancelled execution may take to acknowledge before it is killed
    pub abort_grace_ms: u64,
    pub prerequisite_policy: PrerequisitePolicy,
    /// Capacity of the request channel into the control loop
    pub channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            jobs_dir: std::env::temp_dir().join("digits-lite").join("jobs"),
            max_running: 2,
            max_jobs: 10_000,
            abort_grace_ms: 5_000,
            prerequisite_policy: PrerequisitePolicy::Wait,
            channel_capacity: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Self {
        Self {
            jobs_dir: jobs_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_max_running(mut self, max_running: usize) -> Self {
        self.max_running = max_running;
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_abort_grace_ms(mut self, abort_grace_ms: u64) -> Self {
        self.abort_grace_ms = abort_grace_ms;
        self
    }

    pub fn with_prerequisite_policy(mut self, policy: PrerequisitePolicy) -> Self {
        self.prerequisite_policy = policy;
        self
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }
}

/// Shell commands run by [`CommandRunner`](crate::worker::CommandRunner).
///
/// Each command runs through `sh -c` inside the job's working directory,
/// with the job's parameters exported as environment variables.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub dataset_command: String,
    pub model_command: String,
    /// File in the working directory receiving stdout and stderr
    pub log_file: String,
    /// Number of stderr lines kept in the error message of a failed job
    pub error_tail_lines: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            dataset_command: r#"if [ "$DATASET_METHOD" = "folder" ]; then
  find "$TRAIN_FOLDER" -mindepth 2 -type f | sort > train.txt
  ls -1 "$TRAIN_FOLDER" | sort > labels.txt
else
  cp "$TRAIN_IMAGES" train.txt && cp "$LABELS_FILE" labels.txt
fi
test -s train.txt"#
                .to_string(),
            model_command: r#"test -s "$DATASET_DIR/train.txt" || { echo "dataset is not prepared" >&2; exit 1; }
for epoch in $(seq 1 "$TRAIN_EPOCHS"); do echo "epoch $epoch"; sleep 1; done
echo "$NETWORK" > snapshot.txt"#
                .to_string(),
            log_file: "output.log".to_string(),
            error_tail_lines: 20,
        }
    }
}

impl RunnerConfig {
    pub fn new(dataset_command: impl Into<String>, model_command: impl Into<String>) -> Self {
        Self {
            dataset_command: dataset_command.into(),
            model_command: model_command.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub scheduler: SchedulerConfig,
    pub runner: RunnerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            scheduler: SchedulerConfig::default(),
            runner: RunnerConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr, scheduler: SchedulerConfig) -> Self {
        Self {
            listen_addr,
            scheduler,
            ..Default::default()
        }
    }

    pub fn with_runner(mut self, runner: RunnerConfig) -> Self {
        self.runner = runner;
        self
    }
}
