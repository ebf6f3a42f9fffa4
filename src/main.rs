//! Hatrac -- hierarchical, versioned, access-controlled object storage.
//!
//! Crash-only design: every startup is a recovery. There is no separate
//! recovery mode. SIGTERM/SIGINT handlers only stop accepting connections
//! and wait with a timeout before exiting -- no cleanup.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use hatrac::directory::sqlite::SqliteDirectory;
use hatrac::directory::MetadataDirectory;
use hatrac::storage::backend::StorageBackend;
use hatrac::storage::filesystem::FilesystemBackend;
use hatrac::storage::overlay::OverlayBackend;
use hatrac::storage::s3::S3Backend;

/// Command-line arguments for the Hatrac server.
#[derive(Parser, Debug)]
#[command(name = "hatrac", version, about = "Hierarchical, versioned, access-controlled object storage")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "hatrac.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    info!("Loading configuration from {}", cli.config);
    let config = hatrac::config::load_config(&cli.config)?;

    let bind_addr = cli.bind.unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    // Crash-only startup: every startup IS recovery.
    info!("Crash-only startup: performing recovery checks");

    if config.observability.metrics {
        hatrac::metrics::init_metrics();
        hatrac::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let directory_path = &config.directory.path;
    if let Some(parent) = std::path::Path::new(directory_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let root_roles: Vec<&str> = config.directory.root_roles.iter().map(|s| s.as_str()).collect();
    let directory: Arc<dyn MetadataDirectory> = Arc::new(SqliteDirectory::new(directory_path, &root_roles)?);
    info!("SQLite metadata directory initialized at {}", directory_path);

    let storage: Arc<dyn StorageBackend> = build_storage_backend(&config).await?;
    info!(backend = %config.storage.backend, "storage backend initialized");

    let state = Arc::new(hatrac::AppState {
        config: config.clone(),
        directory,
        storage,
    });

    let app = hatrac::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Hatrac listening on {}", bind_addr);

    // Graceful shutdown: on SIGTERM/SIGINT, stop accepting new connections,
    // wait for in-flight requests to complete (with timeout), then exit.
    // No cleanup -- crash-only design means next startup handles recovery.
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("Hatrac shut down");

    Ok(())
}

/// Build the configured bulk-storage backend (§4.6). `overlay` composes
/// its members from the same `storage` section, one sub-backend per
/// `storage.overlay` entry, with the first entry authoritative for writes.
async fn build_storage_backend(config: &hatrac::config::Config) -> anyhow::Result<Arc<dyn StorageBackend>> {
    match config.storage.backend.as_str() {
        "filesystem" => Ok(Arc::new(FilesystemBackend::new(&config.storage.storage_path)?)),
        "s3" => Ok(Arc::new(build_s3_backend(config).await?)),
        "overlay" => {
            if config.storage.overlay.is_empty() {
                anyhow::bail!("storage.backend is 'overlay' but storage.overlay lists no members");
            }
            let mut members: Vec<Box<dyn StorageBackend>> = Vec::new();
            for kind in &config.storage.overlay {
                let member: Box<dyn StorageBackend> = match kind.as_str() {
                    "filesystem" => Box::new(FilesystemBackend::new(&config.storage.storage_path)?),
                    "s3" => Box::new(build_s3_backend(config).await?),
                    other => anyhow::bail!("unrecognized overlay member backend '{other}'"),
                };
                members.push(member);
            }
            Ok(Arc::new(OverlayBackend::new(members)?))
        }
        other => anyhow::bail!("unrecognized storage.backend '{other}' (expected filesystem, s3, or overlay)"),
    }
}

async fn build_s3_backend(config: &hatrac::config::Config) -> anyhow::Result<S3Backend> {
    let (prefix, bucket) = config
        .storage
        .s3_config
        .buckets
        .iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("storage.backend is 's3' but storage.s3_config.buckets is empty"))?;

    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest()).region(aws_config::Region::new(bucket.region.clone()));
    if !bucket.endpoint_url.is_empty() {
        loader = loader.endpoint_url(&bucket.endpoint_url);
    }
    let sdk_config = loader.load().await;
    let client = aws_sdk_s3::Client::new(&sdk_config);

    let threshold = (bucket.presigned_url_threshold > 0).then_some(bucket.presigned_url_threshold);
    S3Backend::new(
        client,
        bucket.bucket_name.clone(),
        bucket.bucket_path_prefix.clone(),
        threshold,
        bucket.presigned_url_expiration_secs,
    )
    .await
    .with_context(|| format!("initializing S3 backend for bucket prefix '{prefix}'"))
}

use anyhow::Context;

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
