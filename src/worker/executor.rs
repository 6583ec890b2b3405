use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::RunnerConfig;
use crate::scheduler::job::{DatasetParams, DatasetSource, ModelParams, Network};
use crate::worker::runner::{ExecutionContext, ExecutionError, JobRunner};

const NETWORK_FILE: &str = "network.prototxt";

/// Runs each job as a shell command inside its working directory.
///
/// Job parameters are exported as environment variables. Stdout and stderr
/// end up in the configured log file. A cancelled job has its process
/// killed; dropping the execution (forced abort) kills it as well.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    config: RunnerConfig,
}

impl CommandRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn base_env(ctx: &ExecutionContext, kind: &str) -> Vec<(String, String)> {
        vec![
            ("JOB_ID".to_string(), ctx.job_id.to_string()),
            ("JOB_DIR".to_string(), ctx.work_dir.display().to_string()),
            ("JOB_KIND".to_string(), kind.to_string()),
        ]
    }

    fn dataset_env(ctx: &ExecutionContext, params: &DatasetParams) -> Vec<(String, String)> {
        let mut env = Self::base_env(ctx, "dataset");
        env.push(("DATASET_METHOD".to_string(), params.method().to_string()));
        env.push(("RESIZE_WIDTH".to_string(), params.resize_width.to_string()));
        env.push(("RESIZE_HEIGHT".to_string(), params.resize_height.to_string()));

        match &params.source {
            DatasetSource::Folder {
                train_folder,
                val_folder,
                val_percent,
            } => {
                env.push(("TRAIN_FOLDER".to_string(), train_folder.display().to_string()));
                if let Some(val) = val_folder {
                    env.push(("VAL_FOLDER".to_string(), val.display().to_string()));
                }
                env.push(("VAL_PERCENT".to_string(), val_percent.to_string()));
            }
            DatasetSource::TextFile {
                train_images,
                val_images,
                labels_file,
                image_folder,
            } => {
                env.push(("TRAIN_IMAGES".to_string(), train_images.display().to_string()));
                if let Some(val) = val_images {
                    env.push(("VAL_IMAGES".to_string(), val.display().to_string()));
                }
                env.push(("LABELS_FILE".to_string(), labels_file.display().to_string()));
                if let Some(folder) = image_folder {
                    env.push(("IMAGE_FOLDER".to_string(), folder.display().to_string()));
                }
            }
        }
        env
    }

    fn model_env(ctx: &ExecutionContext, params: &ModelParams) -> Vec<(String, String)> {
        let mut env = Self::base_env(ctx, "model");
        env.push(("DATASET_ID".to_string(), params.dataset.to_string()));
        if let Some(dir) = ctx.dataset_dir() {
            env.push(("DATASET_DIR".to_string(), dir.display().to_string()));
        }
        env.push(("NETWORK".to_string(), params.network.describe().to_string()));
        if let Network::Custom { .. } = params.network {
            env.push((
                "NETWORK_FILE".to_string(),
                ctx.work_dir.join(NETWORK_FILE).display().to_string(),
            ));
        }
        env.push(("TRAIN_EPOCHS".to_string(), params.train_epochs.to_string()));
        if let Some(batch_size) = params.batch_size {
            env.push(("BATCH_SIZE".to_string(), batch_size.to_string()));
        }
        env.push(("LEARNING_RATE".to_string(), params.learning_rate.to_string()));
        env
    }

    async fn run_command(
        &self,
        ctx: &ExecutionContext,
        command: &str,
        env: Vec<(String, String)>,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionError> {
        tracing::info!(job_id = %ctx.job_id, work_dir = %ctx.work_dir.display(), "Executing job command");

        let log_path = ctx.work_dir.join(&self.config.log_file);
        let log = tokio::fs::File::create(&log_path).await?.into_std().await;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.work_dir)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut buf).await;
            }
            buf
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                tracing::info!(job_id = %ctx.job_id, "Killing cancelled job process");
                if let Err(e) = child.start_kill() {
                    tracing::warn!(job_id = %ctx.job_id, error = %e, "Failed to kill job process");
                }
                let _ = child.wait().await;
                return Err(ExecutionError::Cancelled);
            }
        };

        let stderr = stderr_task.await.unwrap_or_default();
        if !stderr.is_empty() {
            let mut log = tokio::fs::OpenOptions::new()
                .append(true)
                .open(&log_path)
                .await?;
            log.write_all(&stderr).await?;
        }

        tracing::info!(
            job_id = %ctx.job_id,
            exit_code = ?status.code(),
            success = status.success(),
            "Job command finished"
        );

        if status.success() {
            Ok(())
        } else {
            Err(ExecutionError::Failed(Self::failure_message(
                &stderr,
                status.code(),
                self.config.error_tail_lines,
            )))
        }
    }

    fn failure_message(stderr: &[u8], exit_code: Option<i32>, tail_lines: usize) -> String {
        let text = String::from_utf8_lossy(stderr);
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.is_empty() {
            return format!("Exit code: {:?}", exit_code);
        }
        let start = lines.len().saturating_sub(tail_lines);
        lines[start..].join("\n")
    }
}

#[async_trait]
impl JobRunner for CommandRunner {
    async fn prepare_dataset(
        &self,
        ctx: &ExecutionContext,
        params: &DatasetParams,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionError> {
        let env = Self::dataset_env(ctx, params);
        self.run_command(ctx, &self.config.dataset_command, env, cancel)
            .await
    }

    async fn train_model(
        &self,
        ctx: &ExecutionContext,
        params: &ModelParams,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutionError> {
        if ctx.dataset_dir().is_none() {
            return Err(ExecutionError::Failed(format!(
                "dataset {} is not available to model {}",
                params.dataset, ctx.job_id
            )));
        }
        if let Network::Custom { definition } = &params.network {
            tokio::fs::write(ctx.work_dir.join(NETWORK_FILE), definition).await?;
        }
        let env = Self::model_env(ctx, params);
        self.run_command(ctx, &self.config.model_command, env, cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_message_keeps_stderr_tail() {
        let stderr = b"one\ntwo\n\nthree\n";
        assert_eq!(CommandRunner::failure_message(stderr, Some(1), 2), "two\nthree");
    }

    #[test]
    fn failure_message_falls_back_to_exit_code() {
        assert_eq!(
            CommandRunner::failure_message(b"", Some(3), 20),
            "Exit code: Some(3)"
        );
    }
}
