use clap::{Parser, ValueEnum};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use digits_lite::api::{
    AckResponse, CreateDatasetRequest, CreateJobResponse, CreateModelRequest, JobResponse,
    StatusResponse,
};
use digits_lite::config::{PrerequisitePolicy, RunnerConfig, SchedulerConfig, ServerConfig};
use digits_lite::scheduler::{DatasetParams, DatasetSource, JobId, JobState, ModelParams, Network};
use digits_lite::server::Server;
use digits_lite::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "digits-lite")]
#[command(version)]
#[command(about = "A dependency-aware job scheduler for dataset preparation and model training")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduler and its HTTP API
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to bind the HTTP API to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port for the HTTP API
    #[arg(long, env = "DIGITS_PORT", default_value = "5000")]
    port: u16,

    /// Directory holding one working directory per job
    #[arg(long, env = "DIGITS_JOBS_DIR")]
    jobs_dir: Option<PathBuf>,

    /// Maximum number of jobs running at once
    #[arg(long, default_value = "2")]
    max_running: usize,

    /// Maximum number of jobs kept by the scheduler
    #[arg(long, default_value = "10000")]
    max_jobs: usize,

    /// Grace period for a cancelled job before it is terminated
    #[arg(long, default_value = "5000")]
    abort_grace_ms: u64,

    /// What happens to waiting dependents of a failed job: "wait" or "cascade"
    #[arg(long, default_value = "wait")]
    prerequisite_policy: PrerequisitePolicy,

    /// Shell command preparing a dataset (runs in the job directory)
    #[arg(long)]
    dataset_command: Option<String>,

    /// Shell command training a model (runs in the job directory)
    #[arg(long)]
    model_command: Option<String>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:5000")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindFilter {
    Dataset,
    Model,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Create a dataset job
    Dataset {
        /// Dataset name
        #[arg(long)]
        name: String,

        /// Folder with one subfolder of images per label
        #[arg(long, conflicts_with_all = ["train_images", "labels_file"])]
        folder: Option<PathBuf>,

        /// Separate validation folder
        #[arg(long, requires = "folder")]
        val_folder: Option<PathBuf>,

        /// Percentage of images used for validation
        #[arg(long, default_value = "25")]
        val_percent: u8,

        /// Text file with "<image> <label index>" lines
        #[arg(long, requires = "labels_file")]
        train_images: Option<PathBuf>,

        /// Text file with one label per line
        #[arg(long, requires = "train_images")]
        labels_file: Option<PathBuf>,

        /// Base folder for relative image paths in the text files
        #[arg(long)]
        image_folder: Option<PathBuf>,

        #[arg(long, default_value = "256")]
        resize_width: u32,

        #[arg(long, default_value = "256")]
        resize_height: u32,
    },
    /// Create a model job training on a dataset
    Model {
        /// Model name
        #[arg(long)]
        name: String,

        /// Dataset job ID
        #[arg(long)]
        dataset: JobId,

        /// Standard network name
        #[arg(long, conflicts_with = "network_file")]
        network: Option<String>,

        /// File with a custom network definition
        #[arg(long)]
        network_file: Option<PathBuf>,

        #[arg(long, default_value = "30")]
        epochs: u32,

        #[arg(long)]
        batch_size: Option<u32>,

        #[arg(long, default_value = "0.01")]
        learning_rate: f64,
    },
    /// Get the status of a job
    Status { job_id: String },
    /// Show a job
    Get { job_id: String },
    /// List jobs
    List {
        #[arg(long)]
        kind: Option<KindFilter>,
    },
    /// Abort a job
    Abort { job_id: String },
    /// Delete a job and its files
    Delete { job_id: String },
    /// Poll a job until it finishes
    Wait {
        job_id: String,

        #[arg(long, default_value = "60")]
        timeout_secs: u64,

        #[arg(long, default_value = "500")]
        poll_ms: u64,
    },
}

// =============================================================================
// HTTP Client
// =============================================================================

struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    fn new(base_url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        // Creation answers 303; keep it so the job id can be read from the body
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn parse<T: DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, Box<dyn std::error::Error>> {
        let status = resp.status();
        if status.is_success() || status.is_redirection() {
            return Ok(resp.json().await?);
        }
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        let message = body
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("request failed")
            .to_string();
        Err(format!("{} ({})", message, status).into())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Box<dyn std::error::Error>> {
        Self::parse(self.http.get(self.url(path)).send().await?).await
    }

    async fn post<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, Box<dyn std::error::Error>> {
        let mut req = self.http.post(self.url(path));
        if let Some(body) = body {
            req = req.json(body);
        }
        Self::parse(req.send().await?).await
    }

    async fn delete<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, Box<dyn std::error::Error>> {
        Self::parse(self.http.delete(self.url(path)).send().await?).await
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn print_job(
    job: &JobResponse,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(job)?),
        OutputFormat::Table => {
            println!("Job ID:       {}", job.id);
            println!("Name:         {}", job.name);
            println!("Kind:         {}", job.kind);
            println!("Status:       {}", job.status);
            if !job.dependencies.is_empty() {
                println!("Depends on:   {}", job.dependencies.join(", "));
            }
            if !job.dependents.is_empty() {
                println!("Used by:      {}", job.dependents.join(", "));
            }
            println!("Created:      {}", job.created_at);
            if let Some(started) = job.started_at {
                println!("Started:      {}", started);
            }
            if let Some(finished) = job.finished_at {
                println!("Finished:     {}", finished);
            }
            if let Some(error) = &job.error {
                println!("Error:");
                for line in error.lines() {
                    println!("  {}", line);
                }
            }
        }
    }
    Ok(())
}

fn print_created(
    resp: &CreateJobResponse,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(resp)?),
        OutputFormat::Table => {
            println!("Job created successfully!");
            println!("Job ID: {}", resp.job_id);
        }
    }
    Ok(())
}

fn print_ack(
    action: &str,
    resp: &AckResponse,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(resp)?),
        OutputFormat::Table => println!("Job {} {}", resp.job_id, action),
    }
    Ok(())
}

fn build_server_config(args: ServerArgs) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;

    let mut scheduler = SchedulerConfig::default()
        .with_max_running(args.max_running)
        .with_max_jobs(args.max_jobs)
        .with_abort_grace_ms(args.abort_grace_ms)
        .with_prerequisite_policy(args.prerequisite_policy);
    if let Some(jobs_dir) = args.jobs_dir {
        scheduler.jobs_dir = jobs_dir;
    }

    let mut runner = RunnerConfig::default();
    if let Some(cmd) = args.dataset_command {
        runner.dataset_command = cmd;
    }
    if let Some(cmd) = args.model_command {
        runner.model_command = cmd;
    }

    Ok(ServerConfig::new(listen_addr, scheduler).with_runner(runner))
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = build_server_config(args)?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        jobs_dir = %config.scheduler.jobs_dir.display(),
        max_running = config.scheduler.max_running,
        abort_grace_ms = config.scheduler.abort_grace_ms,
        prerequisite_policy = ?config.scheduler.prerequisite_policy,
        "Starting digits-lite"
    );

    let shutdown = CancellationToken::new();
    install_shutdown_handler(shutdown.clone())?;

    Server::new(config).run(shutdown).await
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_command(
    client: &ApiClient,
    command: JobCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        JobCommands::Dataset {
            name,
            folder,
            val_folder,
            val_percent,
            train_images,
            labels_file,
            image_folder,
            resize_width,
            resize_height,
        } => {
            let source = match (folder, train_images, labels_file) {
                (Some(train_folder), _, _) => DatasetSource::Folder {
                    train_folder,
                    val_folder,
                    val_percent,
                },
                (None, Some(train_images), Some(labels_file)) => DatasetSource::TextFile {
                    train_images,
                    val_images: None,
                    labels_file,
                    image_folder,
                },
                _ => {
                    return Err(
                        "either --folder or --train-images with --labels-file is required".into(),
                    )
                }
            };
            let request = CreateDatasetRequest {
                dataset_name: name,
                params: DatasetParams {
                    source,
                    resize_width,
                    resize_height,
                },
            };
            let resp: CreateJobResponse = client.post("/datasets", Some(&request)).await?;
            print_created(&resp, output_format)?;
        }
        JobCommands::Model {
            name,
            dataset,
            network,
            network_file,
            epochs,
            batch_size,
            learning_rate,
        } => {
            let network = match (network, network_file) {
                (_, Some(path)) => Network::Custom {
                    definition: tokio::fs::read_to_string(&path).await?,
                },
                (Some(name), None) => Network::Standard { name },
                (None, None) => return Err("either --network or --network-file is required".into()),
            };
            let mut params = ModelParams::new(dataset, network).with_epochs(epochs);
            params.batch_size = batch_size;
            params.learning_rate = learning_rate;
            let request = CreateModelRequest {
                model_name: name,
                params,
            };
            let resp: CreateJobResponse = client.post("/models", Some(&request)).await?;
            print_created(&resp, output_format)?;
        }
        JobCommands::Status { job_id } => {
            let resp: StatusResponse = client.get(&format!("/jobs/{}/status", job_id)).await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&resp)?),
                OutputFormat::Table => println!("{}", resp.status),
            }
        }
        JobCommands::Get { job_id } => {
            let job: JobResponse = client.get(&format!("/jobs/{}", job_id)).await?;
            print_job(&job, output_format)?;
        }
        JobCommands::List { kind } => {
            let path = match kind {
                Some(KindFilter::Dataset) => "/datasets",
                Some(KindFilter::Model) => "/models",
                None => "/jobs",
            };
            let jobs: Vec<JobResponse> = client.get(path).await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
                OutputFormat::Table => {
                    if jobs.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!("{:<38} {:<8} {:<12} NAME", "JOB ID", "KIND", "STATUS");
                        println!("{}", "-".repeat(78));
                        for job in &jobs {
                            println!(
                                "{:<38} {:<8} {:<12} {}",
                                job.id, job.kind, job.status, job.name
                            );
                        }
                        println!();
                        println!("{} job(s)", jobs.len());
                    }
                }
            }
        }
        JobCommands::Abort { job_id } => {
            let resp: AckResponse = client
                .post::<(), _>(&format!("/jobs/{}/abort", job_id), None)
                .await?;
            print_ack("abort requested", &resp, output_format)?;
        }
        JobCommands::Delete { job_id } => {
            let resp: AckResponse = client.delete(&format!("/jobs/{}", job_id)).await?;
            print_ack("deleted", &resp, output_format)?;
        }
        JobCommands::Wait {
            job_id,
            timeout_secs,
            poll_ms,
        } => {
            let deadline = Instant::now() + Duration::from_secs(timeout_secs);
            loop {
                let resp: StatusResponse =
                    client.get(&format!("/jobs/{}/status", job_id)).await?;
                let finished = resp
                    .status
                    .parse::<JobState>()
                    .map(|s| s.is_terminal())
                    .unwrap_or(false);
                if finished {
                    match output_format {
                        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&resp)?),
                        OutputFormat::Table => println!("{}", resp.status),
                    }
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(format!(
                        "job {} still {} after {}s",
                        job_id, resp.status, timeout_secs
                    )
                    .into());
                }
                tokio::time::sleep(Duration::from_millis(poll_ms)).await;
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Job { client, command } => {
            let api = ApiClient::new(&client.addr)?;
            if let Err(e) = handle_job_command(&api, command, &client.output).await {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
