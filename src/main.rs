use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use recon_dispatch::agent::StaticRegistry;
use recon_dispatch::config::{parse_agents, NodeConfig, SchedulerConfig, TlsConfig};
use recon_dispatch::grpc::GrpcConnector;
use recon_dispatch::node::Node;
use recon_dispatch::scheduler::{load_jobs, Job};
use recon_dispatch::shutdown::install_shutdown_handler;
use recon_dispatch::store::MemoryStore;
use recon_dispatch::tls::TlsIdentity;

#[derive(Parser, Debug)]
#[command(name = "recon-dispatch")]
#[command(version)]
#[command(about = "Priority scheduler that dispatches reconnaissance jobs to scanning agents")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the scheduler against a set of agents
    Server(ServerArgs),

    /// Parse and validate a jobs file without dispatching anything
    Validate {
        /// JSON file holding an array of job descriptions
        file: PathBuf,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Agents to dial (comma-separated, format: "id:host:port[:min_priority]")
    /// Example: "1:10.0.0.5:50051,2:10.0.0.6:50051:high"
    #[arg(long, default_value = "")]
    agents: String,

    /// Milliseconds between scheduler ticks
    #[arg(long, default_value = "1000")]
    poll_interval_ms: u64,

    /// Maximum number of queued jobs
    #[arg(long, default_value = "256")]
    queue_capacity: usize,

    /// Channel depth of each ingestion worker
    #[arg(long, default_value = "64")]
    pipeline_buffer: usize,

    /// Milliseconds allowed for establishing an agent connection
    #[arg(long, default_value = "5000")]
    connect_timeout_ms: u64,

    /// Milliseconds an agent has to answer a dispatched job before it is re-queued
    #[arg(long, default_value = "10000")]
    open_timeout_ms: u64,

    /// Jobs to queue at start-up (JSON array)
    #[arg(long)]
    jobs: Option<PathBuf>,

    // === TLS Options ===
    /// Dial agents over TLS
    #[arg(long)]
    tls: bool,

    /// Path to the CA certificate that signed the agents' certificates (PEM format)
    #[arg(long, requires = "tls")]
    ca_cert: Option<PathBuf>,

    /// Path to the client certificate presented to agents (PEM format)
    #[arg(long, requires = "tls")]
    cert: Option<PathBuf>,

    /// Path to the client private key (PEM format)
    #[arg(long, requires = "tls")]
    key: Option<PathBuf>,

    /// Name the agents' certificates are issued for
    #[arg(long, requires = "tls")]
    tls_domain: Option<String>,

    /// Allow running without TLS even when --tls is specified but certs are missing.
    /// Useful for development. NOT recommended for production.
    #[arg(long)]
    allow_insecure: bool,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSummary {
    job_id: String,
    kind: String,
    priority: String,
    weight: i64,
    targets: usize,
    exceptions: usize,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id().to_string(),
            kind: job.meta.kind.to_string(),
            priority: job.priority().to_string(),
            weight: job.weight(),
            targets: job.payload.targets.len(),
            exceptions: job.payload.exceptions.len(),
        }
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn load_tls_identity(
    tls_config: &TlsConfig,
) -> Result<Option<TlsIdentity>, Box<dyn std::error::Error>> {
    if tls_config.is_complete() {
        match TlsIdentity::load(tls_config).await {
            Ok(identity) => {
                tracing::info!(
                    mtls = identity.has_client_identity(),
                    "TLS enabled for agent channels"
                );
                Ok(Some(identity))
            }
            Err(e) => {
                if tls_config.allow_insecure {
                    tracing::warn!(
                        error = %e,
                        "TLS certificate loading failed, running in insecure mode"
                    );
                    Ok(None)
                } else {
                    Err(format!("TLS certificate loading failed: {}", e).into())
                }
            }
        }
    } else if tls_config.enabled {
        if tls_config.allow_insecure {
            tracing::warn!("TLS enabled but no CA certificate given, running in insecure mode");
            Ok(None)
        } else {
            Err("TLS enabled but missing required path (--ca-cert)".into())
        }
    } else {
        Ok(None)
    }
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let tls_config = TlsConfig {
        enabled: args.tls,
        ca_cert_path: args.ca_cert,
        cert_path: args.cert,
        key_path: args.key,
        domain_name: args.tls_domain,
        allow_insecure: args.allow_insecure,
    };
    let tls_identity = load_tls_identity(&tls_config).await?;

    let scheduler = SchedulerConfig {
        poll_interval_ms: args.poll_interval_ms,
        queue_capacity: args.queue_capacity,
        pipeline_buffer: args.pipeline_buffer,
        connect_timeout_ms: args.connect_timeout_ms,
        open_timeout_ms: args.open_timeout_ms,
    };
    let config = NodeConfig {
        agents: parse_agents(&args.agents)?,
        tls: tls_config,
        ..NodeConfig::new(scheduler)
    };

    tracing::info!(
        agents = config.agents.len(),
        poll_interval_ms = config.scheduler.poll_interval_ms,
        queue_capacity = config.scheduler.queue_capacity,
        tls_enabled = tls_identity.is_some(),
        "Starting recon-dispatch"
    );

    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(StaticRegistry::new(config.agents.clone()));
    let connector = Arc::new(GrpcConnector::new(
        tls_identity,
        config.scheduler.connect_timeout(),
    ));
    let node = Node::new(config, registry, connector, store.clone(), store.clone());

    let shutdown = install_shutdown_handler()?;
    let (registered, scheduler_handle) = node.start().await?;
    tracing::info!(registered, "Agents registered");

    if let Some(path) = args.jobs {
        let jobs = load_jobs(&path)?;
        tracing::info!(count = jobs.len(), file = %path.display(), "Queuing jobs from file");
        for job in jobs {
            let job_id = job.id();
            if let Err(e) = node.enqueue_job(job).await {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to queue job");
            }
        }
    }

    shutdown.cancelled().await;
    node.shutdown();
    if let Err(e) = scheduler_handle.await {
        tracing::error!(error = %e, "Scheduler loop ended abnormally");
    }

    tracing::info!(
        queued = node.queue_snapshot().await.len(),
        jobs = store.job_count().await,
        targets = store.targets().await.len(),
        scans = store.scan_count().await,
        "Scheduler shut down"
    );
    Ok(())
}

// =============================================================================
// Validate Command
// =============================================================================

fn handle_validate(
    file: PathBuf,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = load_jobs(&file)?;
    let summaries: Vec<JobSummary> = jobs.iter().map(JobSummary::from).collect();

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
        OutputFormat::Table => {
            if summaries.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!(
                "{:<38} {:<10} {:<9} {:>7} {:>8}",
                "JOB ID", "KIND", "PRIORITY", "WEIGHT", "TARGETS"
            );
            println!("{}", "-".repeat(76));
            for job in &summaries {
                println!(
                    "{:<38} {:<10} {:<9} {:>7} {:>8}",
                    job.job_id, job.kind, job.priority, job.weight, job.targets
                );
            }
            println!();
            println!("{} job(s) valid", summaries.len());
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

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Validate { file, output } => {
            handle_validate(file, &output)?;
        }
    }

    Ok(())
}
