//! Ingot -- content-addressed blob storage server.
//!
//! Crash-only design: every startup is a recovery. Startup sweeps the
//! staging directory for orphaned partial uploads; SIGTERM/SIGINT
//! handlers only stop accepting connections and wait for in-flight
//! requests before exiting -- no cleanup.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

/// Command-line arguments for the Ingot server.
#[derive(Parser, Debug)]
#[command(
    name = "ingot",
    version,
    about = "Content-addressed blob storage server"
)]
struct Cli {
    /// Path to the YAML configuration file. Without it, configuration
    /// comes from defaults plus INGOT_* environment variables.
    #[arg(short, long)]
    config: Option<String>,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ingot::config::load_config(path)?,
        None => ingot::config::from_env()?,
    };

    // Initialize tracing / logging. RUST_LOG wins over the config level.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    if let Some(path) = &cli.config {
        info!("Loaded configuration from {}", path);
    } else {
        info!("No config file given; using defaults and INGOT_* environment");
    }

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    // Initialize Prometheus metrics recorder and register metric descriptions.
    if config.observability.metrics {
        ingot::metrics::init_metrics();
        ingot::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    // Open the blob store. Crash-only startup: orphaned staging files
    // from a previous run are swept here.
    let blobs = Arc::new(ingot::blobstore::BlobStore::open(
        &config.storage.root_dir,
        config.storage.create_dirs,
    )?);
    info!("Blob store opened at {}", config.storage.root_dir);

    // Initialize the namespace index.
    let index: Arc<dyn ingot::index::store::NamespaceIndex> =
        match config.index.engine.as_str() {
            "memory" => {
                info!("In-memory namespace index initialized (no durability)");
                Arc::new(ingot::index::memory::MemoryNamespaceIndex::new())
            }
            _ => {
                // Ensure parent directory exists for the SQLite file.
                if let Some(parent) = std::path::Path::new(&config.index.path).parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let store = ingot::index::sqlite::SqliteNamespaceIndex::new(&config.index.path)?;
                info!("SQLite namespace index initialized at {}", config.index.path);
                Arc::new(store)
            }
        };

    let service =
        ingot::upload::UploadService::new(blobs, index, config.server.max_upload_size);

    let state = Arc::new(ingot::AppState {
        config: config.clone(),
        service,
    });

    let app = ingot::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Ingot listening on {}", bind_addr);

    // Graceful shutdown: on SIGTERM/SIGINT, stop accepting new connections
    // and give in-flight requests a bounded drain window
    // (server.shutdown_timeout). No cleanup -- crash-only design means next
    // startup handles recovery.
    let shutdown_started = Arc::new(tokio::sync::Notify::new());
    let mut server = {
        let shutdown_started = Arc::clone(&shutdown_started);
        tokio::spawn(
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_signal().await;
                    shutdown_started.notify_one();
                })
                .into_future(),
        )
    };

    tokio::select! {
        result = &mut server => {
            result??;
        }
        _ = shutdown_started.notified() => {
            let drain = Duration::from_secs(config.server.shutdown_timeout);
            match tokio::time::timeout(drain, &mut server).await {
                Ok(result) => result??,
                Err(_) => warn!(
                    "Shutdown timeout of {}s elapsed with requests still in flight; exiting",
                    config.server.shutdown_timeout
                ),
            }
        }
    }

    info!("Ingot shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
