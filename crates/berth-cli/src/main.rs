use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use berth_core::app::{ControlPlane, ControlPlaneBuilder, CreateContainer};
use berth_core::config::BerthConfig;
use berth_core::impls::{DockerGateway, InMemoryEventLog, InMemoryRuntime, TimeoutGateway};
use berth_core::ports::RuntimeGateway;

/// Single-host container control plane.
#[derive(Debug, Parser)]
#[command(name = "berth", version)]
struct Cli {
    /// TOML config file. Missing file means defaults.
    #[arg(long, default_value = "berth.toml")]
    config: PathBuf,

    /// Use an in-process fake engine instead of the Docker daemon.
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the reconcile loop until Ctrl-C.
    ///
    /// Repositories live in memory, so without `--image` the loop has nothing
    /// to reconcile.
    Serve {
        /// Deploy a container from this image reference before the loop starts. Repeatable.
        #[arg(long = "image")]
        images: Vec<String>,
    },
    /// Create one container and print the resulting record as JSON.
    Deploy {
        #[arg(long)]
        image: String,
        #[arg(long)]
        internal_port: Option<u16>,
        #[arg(long)]
        host_port: Option<u16>,
        #[arg(long)]
        memory_mb: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = BerthConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = connect_runtime(&config, cli.dry_run).await?;
    let events = Arc::new(InMemoryEventLog::new());
    let plane = ControlPlaneBuilder::from_config(&config)
        .runtime(runtime)
        .in_memory_repositories()
        .events(events.clone())
        .build()?;

    match cli.command {
        Command::Serve { images } => serve(&plane, &events, images).await,
        Command::Deploy {
            image,
            internal_port,
            host_port,
            memory_mb,
        } => {
            let mut request = CreateContainer::from_reference(image);
            request.internal_port = internal_port;
            request.host_port = host_port;
            request.memory_limit_mb = memory_mb;

            let container = plane.containers.create(request).await?;
            println!("{}", serde_json::to_string_pretty(&container)?);
            Ok(())
        }
    }
}

async fn connect_runtime(
    config: &BerthConfig,
    dry_run: bool,
) -> anyhow::Result<Arc<dyn RuntimeGateway>> {
    let timeout = config.call_timeout();
    if dry_run {
        info!("dry run: using in-memory runtime");
        return Ok(Arc::new(TimeoutGateway::new(InMemoryRuntime::new(), timeout)));
    }
    let docker = DockerGateway::connect(
        config.runtime.docker_socket.as_deref(),
        config.runtime.connect_timeout_secs,
    )
    .await
    .context("connecting to docker")?;
    Ok(Arc::new(TimeoutGateway::new(docker, timeout)))
}

async fn serve(
    plane: &ControlPlane,
    events: &InMemoryEventLog,
    images: Vec<String>,
) -> anyhow::Result<()> {
    seed(plane, images).await?;
    let reconcile = plane.spawn_reconcile();
    info!(interval = ?plane.reconcile_interval(), "berth serving; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutdown requested");
    reconcile.shutdown_and_join().await;

    let counts = plane.containers.counts().await?;
    info!(
        running = counts.running,
        stopped = counts.stopped,
        failed = counts.failed,
        diagnostics = events.len(),
        "berth stopped"
    );
    Ok(())
}

async fn seed(plane: &ControlPlane, images: Vec<String>) -> anyhow::Result<()> {
    for image in images {
        let container = plane
            .containers
            .create(CreateContainer::from_reference(image.as_str()))
            .await
            .with_context(|| format!("deploying {image}"))?;
        info!(
            container_id = %container.id,
            %image,
            status = %container.status,
            exposed_port = ?container.exposed_port,
            "seed container deployed"
        );
    }

    Ok(())
}
