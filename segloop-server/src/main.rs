//! segloop-server - segmentation annotation loop backend
//!
//! Accepts uploaded scans, runs nnU-Net inference on them, hands the
//! predictions to CVAT for correction and folds corrected cases back into
//! nnU-Net training datasets.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use segloop_common::config::{RootFolderInitializer, RootFolderResolver, TomlConfig};
use segloop_server::services::cvat_client::CvatClient;
use segloop_server::services::tool_runner::ProcessRunner;
use segloop_server::workspace::Workspace;
use segloop_server::AppState;

/// Command-line arguments for segloop-server
#[derive(Parser, Debug)]
#[command(name = "segloop-server")]
#[command(about = "Inference and annotation loop backend for nnU-Net and CVAT")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "SEGLOOP_CONFIG")]
    config: Option<PathBuf>,

    /// Root folder for the database and working directories
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "SEGLOOP_PORT")]
    port: Option<u16>,

    /// Address to bind (overrides the config file)
    #[arg(long, env = "SEGLOOP_BIND")]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = TomlConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind.clone() {
        config.bind = bind;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("segloop_server={0},segloop_common={0},tower_http=info", config.logging.level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting segloop-server");
    info!(
        "Version: {} (git {}, built {}, {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    // Root folder: CLI, then environment, then TOML, then OS default
    let root_folder = RootFolderResolver::new()
        .with_cli_arg(args.root_folder.clone())
        .with_toml(&config)
        .resolve();
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;
    info!("Root folder: {}", initializer.root_folder().display());

    let db_path = initializer.database_path();
    info!("Database: {}", db_path.display());
    let db_pool = segloop_common::db::init_database(&db_path)
        .await
        .context("Failed to open database")?;

    let workspace = Workspace::new(initializer.root_folder());
    workspace.ensure().context("Failed to create working directories")?;

    let platform = CvatClient::new(&config.cvat).context("Failed to create CVAT client")?;
    info!("Annotation platform: {}", config.cvat.host);

    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", config.bind, config.port))?;

    let state = AppState::new(
        db_pool,
        config,
        workspace,
        Arc::new(platform),
        Arc::new(ProcessRunner),
    )
    .context("Invalid dataset configuration")?;
    info!(
        "Datasets: {}",
        state
            .registry
            .iter()
            .map(|d| d.id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    info!("nnU-Net raw datasets: {}", state.nnunet.raw_dir().display());

    let app = segloop_server::build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
