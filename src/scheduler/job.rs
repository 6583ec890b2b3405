use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};

/// Opaque job identifier, unique for the lifetime of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state. The display strings are part of the external contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Initialized,
    Waiting,
    Running,
    Done,
    Abort,
    Error,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Abort | JobState::Error)
    }

    /// True for terminal states other than `Done`; dependents can never be
    /// satisfied by such a prerequisite.
    pub fn is_failed(&self) -> bool {
        matches!(self, JobState::Abort | JobState::Error)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Initialized, Waiting)
                | (Initialized, Running)
                | (Waiting, Running)
                | (Waiting, Abort)
                | (Running, Done)
                | (Running, Error)
                | (Running, Abort)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Initialized => "Initialized",
            JobState::Waiting => "Waiting",
            JobState::Running => "Running",
            JobState::Done => "Done",
            JobState::Abort => "Abort",
            JobState::Error => "Error",
        };
        f.write_str(s)
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Initialized" => Ok(JobState::Initialized),
            "Waiting" => Ok(JobState::Waiting),
            "Running" => Ok(JobState::Running),
            "Done" => Ok(JobState::Done),
            "Abort" => Ok(JobState::Abort),
            "Error" => Ok(JobState::Error),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

const DEFAULT_IMAGE_DIM: u32 = 256;

fn default_image_dim() -> u32 {
    DEFAULT_IMAGE_DIM
}

fn default_val_percent() -> u8 {
    25
}

fn default_train_epochs() -> u32 {
    30
}

fn default_learning_rate() -> f64 {
    0.01
}

/// Where a dataset's images come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum DatasetSource {
    /// One subdirectory per label under `train_folder`.
    Folder {
        train_folder: PathBuf,
        #[serde(default)]
        val_folder: Option<PathBuf>,
        #[serde(default = "default_val_percent")]
        val_percent: u8,
    },
    /// `<image path> <label index>` lines plus a labels file.
    TextFile {
        train_images: PathBuf,
        #[serde(default)]
        val_images: Option<PathBuf>,
        labels_file: PathBuf,
        /// Base folder for relative image paths.
        #[serde(default)]
        image_folder: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetParams {
    #[serde(flatten)]
    pub source: DatasetSource,
    #[serde(default = "default_image_dim")]
    pub resize_width: u32,
    #[serde(default = "default_image_dim")]
    pub resize_height: u32,
}

impl DatasetParams {
    pub fn from_folder(train_folder: impl Into<PathBuf>) -> Self {
        Self {
            source: DatasetSource::Folder {
                train_folder: train_folder.into(),
                val_folder: None,
                val_percent: default_val_percent(),
            },
            resize_width: DEFAULT_IMAGE_DIM,
            resize_height: DEFAULT_IMAGE_DIM,
        }
    }

    pub fn with_resize(mut self, width: u32, height: u32) -> Self {
        self.resize_width = width;
        self.resize_height = height;
        self
    }

    pub fn method(&self) -> &'static str {
        match self.source {
            DatasetSource::Folder { .. } => "folder",
            DatasetSource::TextFile { .. } => "textfile",
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.resize_width == 0 || self.resize_height == 0 {
            return Err(SchedulerError::validation(
                "resize dimensions must be positive",
            ));
        }

        match &self.source {
            DatasetSource::Folder {
                train_folder,
                val_folder,
                val_percent,
            } => {
                if *val_percent > 100 {
                    return Err(SchedulerError::validation(format!(
                        "validation percentage {} is out of range",
                        val_percent
                    )));
                }
                check_label_folder(train_folder)?;
                if let Some(val) = val_folder {
                    check_label_folder(val)?;
                }
            }
            DatasetSource::TextFile {
                train_images,
                val_images,
                labels_file,
                image_folder,
            } => {
                check_non_empty_file(train_images)?;
                check_non_empty_file(labels_file)?;
                if let Some(val) = val_images {
                    check_non_empty_file(val)?;
                }
                if let Some(folder) = image_folder {
                    if !folder.is_dir() {
                        return Err(SchedulerError::validation(format!(
                            "image folder {} does not exist",
                            folder.display()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// A folder is usable when at least one label subdirectory holds a file.
fn check_label_folder(folder: &Path) -> Result<()> {
    if !folder.is_dir() {
        return Err(SchedulerError::validation(format!(
            "folder {} does not exist",
            folder.display()
        )));
    }

    let unreadable = |path: &Path, e: std::io::Error| {
        SchedulerError::validation(format!("cannot read {}: {}", path.display(), e))
    };

    let mut labels = 0usize;
    for entry in std::fs::read_dir(folder).map_err(|e| unreadable(folder, e))? {
        let path = entry.map_err(|e| unreadable(folder, e))?.path();
        if !path.is_dir() {
            continue;
        }
        let has_file = std::fs::read_dir(&path)
            .map_err(|e| unreadable(path.as_path(), e))?
            .filter_map(|e| e.ok())
            .any(|e| e.path().is_file());
        if has_file {
            labels += 1;
        }
    }

    if labels == 0 {
        return Err(SchedulerError::validation(format!(
            "no labeled images found in {}",
            folder.display()
        )));
    }
    Ok(())
}

fn check_non_empty_file(path: &Path) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        Ok(_) => Err(SchedulerError::validation(format!(
            "{} is empty or not a file",
            path.display()
        ))),
        Err(_) => Err(SchedulerError::validation(format!(
            "{} does not exist",
            path.display()
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Network {
    Standard { name: String },
    Custom { definition: String },
}

impl Network {
    pub fn describe(&self) -> &str {
        match self {
            Network::Standard { name } => name,
            Network::Custom { .. } => "custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub dataset: JobId,
    pub network: Network,
    #[serde(default = "default_train_epochs")]
    pub train_epochs: u32,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
}

impl ModelParams {
    pub fn new(dataset: JobId, network: Network) -> Self {
        Self {
            dataset,
            network,
            train_epochs: default_train_epochs(),
            batch_size: None,
            learning_rate: default_learning_rate(),
        }
    }

    pub fn with_epochs(mut self, epochs: u32) -> Self {
        self.train_epochs = epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.train_epochs == 0 {
            return Err(SchedulerError::validation(
                "train_epochs must be at least 1",
            ));
        }
        if self.batch_size == Some(0) {
            return Err(SchedulerError::validation("batch_size must be at least 1"));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(SchedulerError::validation(
                "learning_rate must be a positive number",
            ));
        }
        match &self.network {
            Network::Standard { name } if name.trim().is_empty() => Err(
                SchedulerError::validation("standard network name is empty"),
            ),
            Network::Custom { definition } if definition.trim().is_empty() => Err(
                SchedulerError::validation("custom network definition is empty"),
            ),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKindTag {
    Dataset,
    Model,
}

impl fmt::Display for JobKindTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKindTag::Dataset => write!(f, "dataset"),
            JobKindTag::Model => write!(f, "model"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "params", rename_all = "snake_case")]
pub enum JobKind {
    Dataset(DatasetParams),
    Model(ModelParams),
}

impl JobKind {
    pub fn tag(&self) -> JobKindTag {
        match self {
            JobKind::Dataset(_) => JobKindTag::Dataset,
            JobKind::Model(_) => JobKindTag::Model,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            JobKind::Dataset(params) => params.validate(),
            JobKind::Model(params) => params.validate(),
        }
    }

    /// Prerequisites implied by the parameters themselves.
    pub fn implied_dependencies(&self) -> Vec<JobId> {
        match self {
            JobKind::Dataset(_) => Vec::new(),
            JobKind::Model(params) => vec![params.dataset],
        }
    }

    /// The kind a prerequisite of this kind must have, if constrained.
    pub fn required_prerequisite(&self) -> Option<JobKindTag> {
        match self {
            JobKind::Dataset(_) => None,
            JobKind::Model(_) => Some(JobKindTag::Dataset),
        }
    }
}

/// A creation request as handed to the scheduler.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub kind: JobKind,
    pub depends_on: Vec<JobId>,
}

impl NewJob {
    pub fn dataset(name: impl Into<String>, params: DatasetParams) -> Self {
        Self {
            name: name.into(),
            kind: JobKind::Dataset(params),
            depends_on: Vec::new(),
        }
    }

    pub fn model(name: impl Into<String>, params: ModelParams) -> Self {
        let kind = JobKind::Model(params);
        Self {
            name: name.into(),
            depends_on: kind.implied_dependencies(),
            kind,
        }
    }

    pub fn depends_on(mut self, id: JobId) -> Self {
        if !self.depends_on.contains(&id) {
            self.depends_on.push(id);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::validation("job name is empty"));
        }
        self.kind.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: JobState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub seq: u64,
    pub name: String,
    #[serde(flatten)]
    pub kind: JobKind,
    pub state: JobState,
    pub dependencies: BTreeSet<JobId>,
    pub dependents: BTreeSet<JobId>,
    pub work_dir: PathBuf,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub history: Vec<StateChange>,
}

impl Job {
    pub fn new(id: JobId, seq: u64, name: String, kind: JobKind, work_dir: PathBuf) -> Self {
        let created_at = Utc::now();
        Self {
            id,
            seq,
            name,
            kind,
            state: JobState::Initialized,
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
            work_dir,
            error: None,
            created_at,
            started_at: None,
            finished_at: None,
            history: vec![StateChange {
                state: JobState::Initialized,
                at: created_at,
            }],
        }
    }

    pub fn kind_tag(&self) -> JobKindTag {
        self.kind.tag()
    }

    /// Move along one edge of the state graph. The error text is only kept
    /// for the `Error` state.
    pub fn transition(&mut self, next: JobState, error: Option<String>) -> Result<StateChange> {
        if !self.state.can_transition_to(next) {
            return Err(SchedulerError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        let change = StateChange {
            state: next,
            at: Utc::now(),
        };
        self.state = next;
        match next {
            JobState::Running => self.started_at = Some(change.at),
            JobState::Error => {
                self.error = Some(error.unwrap_or_else(|| "unknown error".to_string()));
                self.finished_at = Some(change.at);
            }
            JobState::Done | JobState::Abort => self.finished_at = Some(change.at),
            _ => {}
        }
        self.history.push(change);
        Ok(change)
    }

    pub fn observed_states(&self) -> Vec<JobState> {
        self.history.iter().map(|c| c.state).collect()
    }
}
