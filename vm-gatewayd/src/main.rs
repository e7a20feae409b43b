mod config;
mod location;
mod names;
mod oplog;
mod provider;
mod dispatch;
mod api;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::location::{InitOutcome, LocationCache};
use crate::names::NameResolver;
use crate::oplog::{db::OpLogDb, OpLogHandle};
use crate::provider::{GcloudProvider, VmProvider};

const DEFAULT_CONFIG_PATH: &str = "/etc/vm-gateway/gatewayd.toml";

fn load_config() -> Result<Config> {
    let mut config = match std::env::args().nth(1) {
        Some(path) => {
            let config = Config::load(&path)
                .with_context(|| format!("Failed to load config from {}", path))?;
            tracing::info!("Loaded config from {}", path);
            config
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            let config = Config::load(DEFAULT_CONFIG_PATH)
                .with_context(|| format!("Failed to load config from {}", DEFAULT_CONFIG_PATH))?;
            tracing::info!("Loaded config from {}", DEFAULT_CONFIG_PATH);
            config
        }
        None => {
            tracing::info!("No config file at {}, using defaults", DEFAULT_CONFIG_PATH);
            Config::default()
        }
    };

    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vm_gatewayd=info"))
        )
        .init();

    tracing::info!("Starting vm-gatewayd");

    let config = load_config()?;

    let provider: Arc<dyn VmProvider> = Arc::new(GcloudProvider::new(&config.provider));
    tracing::info!("Using {} provider", provider.name());

    // Open the operation log
    let db = OpLogDb::open(&config.oplog.db_path)?;
    tracing::info!("Opened operation log at {:?}", config.oplog.db_path);
    let oplog = OpLogHandle::spawn(db);

    // Load or build the location cache; a failed first scan is retried by
    // the scheduler.
    let cache = LocationCache::new(provider.clone(), &config.cache);
    match cache.initialize().await {
        Ok(InitOutcome::LoadedFromDisk { records }) => {
            tracing::info!("Location cache loaded from disk with {} VMs", records)
        }
        Ok(InitOutcome::Refreshed { records }) => {
            tracing::info!("Location cache built with {} VMs", records)
        }
        Ok(InitOutcome::AlreadyInitialized) => {}
        Err(e) => tracing::error!("Location cache starts empty: {}", e),
    }

    let dispatcher = Dispatcher::new(
        provider,
        cache.clone(),
        NameResolver::new(&config.names),
        oplog.clone(),
        config.cache.call_timeout(),
    );

    let app = api::routes::router(api::routes::AppState {
        dispatcher: Arc::new(dispatcher),
        cache: cache.clone(),
        oplog: oplog.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let cancel = CancellationToken::new();

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();

    if let Err(e) = server_handle.await {
        tracing::error!("Server task failed: {}", e);
    }

    cache.shutdown().await;

    if let Err(e) = oplog.shutdown().await {
        tracing::error!("Failed to shutdown operation log: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
