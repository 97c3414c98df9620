#![forbid(unsafe_code)]

//! HTTP API server: videos, comments and likes behind a shared API key.

use std::{io, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use minitube::{
    api::{self, AppState},
    config::{Config, DEFAULT_API_KEY, LogFormat, MediaBackend, StoreBackend},
    json_store::JsonFileStore,
    media::{CloudinaryMediaStore, LocalMediaStore, MediaStore},
    metadata::{SqliteStore, VideoStore},
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("loading configuration")?;
    init_tracing(config.log_format);

    if config.api_key == DEFAULT_API_KEY {
        warn!("API_KEY is not set; falling back to the built-in default key");
    }

    let store: Arc<dyn VideoStore> = match config.store {
        StoreBackend::Sqlite => Arc::new(
            SqliteStore::open(&config.database_path).context("initializing SQLite store")?,
        ),
        StoreBackend::Json => Arc::new(
            JsonFileStore::open(&config.database_path).context("initializing JSON store")?,
        ),
    };
    let media: Arc<dyn MediaStore> = match &config.media {
        MediaBackend::Local => Arc::new(
            LocalMediaStore::new(&config.public_dir).context("initializing local media store")?,
        ),
        MediaBackend::Cloudinary(credentials) => {
            Arc::new(CloudinaryMediaStore::new(credentials.clone()))
        }
    };
    info!(
        store = ?config.store,
        database = %config.database_path.display(),
        cloud_media = matches!(config.media, MediaBackend::Cloudinary(_)),
        "storage ready"
    );

    let app = api::router(AppState::new(store, media, &config));

    let addr = SocketAddr::new(
        config
            .host
            .parse()
            .with_context(|| format!("parsing HOST value {:?}", config.host))?,
        config.port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    info!("API server stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("minitube=info,backend=info,tower_http=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn shutdown_signal() {
    wait_for_shutdown(signal::ctrl_c()).await;
}

/// Resolves once `signal` fires. If the handler could not be installed the
/// server keeps running instead of stopping right after it starts.
async fn wait_for_shutdown(signal: impl Future<Output = io::Result<()>>) {
    if let Err(err) = signal.await {
        warn!(error = %err, "failed to install Ctrl+C handler; shutdown must come from outside");
        std::future::pending::<()>().await;
    }
}
