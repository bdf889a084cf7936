//! capture-node - browser sandbox orchestrator.
//!
//! Usage:
//!   capture-node serve [--port 8080]      # Start HTTP server

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use capture_node::capture::CapturePipeline;
use capture_node::config::{OrchestratorConfig, DEFAULT_SANDBOX_IMAGE};
use capture_node::event_log::HttpEventLog;
use capture_node::http_server::{self, AppState};
use capture_node::orchestrator::SandboxOrchestrator;
use capture_node::sandbox::DockerProvisioner;
use capture_node::state::SessionRegistry;
use capture_node::storage::{BlobStore, FsBlobStore, S3BlobStore, S3Settings};

#[derive(Parser, Debug)]
#[command(name = "capture-node")]
#[command(about = "Browser sandbox orchestrator with verifiable page capture")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "8080")]
    port: u16,

    /// Browser sandbox image
    #[arg(long, env = "SANDBOX_IMAGE", default_value = DEFAULT_SANDBOX_IMAGE)]
    image: String,

    /// Docker network sandboxes join
    #[arg(long, env = "DOCKER_NETWORK")]
    docker_network: Option<String>,

    /// Event log base URL
    #[arg(long, env = "EVENT_LOG_URL", default_value = "http://localhost:8081")]
    event_log_url: String,

    /// S3-compatible endpoint for capture artifacts; without it artifacts
    /// are written under --blob-dir
    #[arg(long, env = "S3_ENDPOINT")]
    s3_endpoint: Option<String>,

    #[arg(long, env = "S3_REGION", default_value = "us-east-1")]
    s3_region: String,

    #[arg(long, env = "S3_BUCKET", default_value = "intrace")]
    s3_bucket: String,

    #[arg(long, env = "S3_ACCESS_KEY", default_value = "")]
    s3_access_key: String,

    #[arg(long, env = "S3_SECRET_KEY", default_value = "", hide_env_values = true)]
    s3_secret_key: String,

    /// Local directory for capture artifacts (development)
    #[arg(long, env = "BLOB_DIR", default_value = "./data")]
    blob_dir: PathBuf,

    /// Public base for stream URLs handed to clients
    #[arg(long, env = "PUBLIC_WS_URL", default_value = "ws://localhost:8080")]
    public_ws_url: String,

    /// Capture viewer base URL
    #[arg(long, env = "VIEWER_URL", default_value = "http://localhost:3000")]
    viewer_url: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("capture_node=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve(serve) => {
            if let Err(e) = run(serve).await {
                error!("{}", e);
                exit(1);
            }
        }
    }
}

async fn run(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = OrchestratorConfig::default()
        .with_image(args.image)
        .with_network(args.docker_network);

    let provisioner = Arc::new(DockerProvisioner::new(config.clone())?);
    let orchestrator = SandboxOrchestrator::start(config, provisioner, SessionRegistry::new())?;

    let store: Arc<dyn BlobStore> = match args.s3_endpoint {
        Some(endpoint) => {
            let s3 = S3BlobStore::connect(S3Settings {
                endpoint,
                region: args.s3_region,
                bucket: args.s3_bucket,
                access_key: args.s3_access_key,
                secret_key: args.s3_secret_key,
            })
            .await;
            s3.ensure_bucket().await?;
            info!(bucket = s3.bucket(), "storing captures in object storage");
            Arc::new(s3)
        }
        None => {
            info!(dir = %args.blob_dir.display(), "storing captures on local disk");
            Arc::new(FsBlobStore::new(args.blob_dir))
        }
    };
    let event_log = Arc::new(HttpEventLog::new(args.event_log_url)?);
    let pipeline = Arc::new(CapturePipeline::new(
        orchestrator.clone(),
        store,
        event_log,
        args.viewer_url,
    ));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down...");
        }
        signal.cancel();
    });

    let state = AppState::new(orchestrator.clone(), pipeline, args.public_ws_url);
    let served = http_server::run_server(args.port, state, shutdown).await;

    orchestrator.shutdown().await;
    served?;
    Ok(())
}
