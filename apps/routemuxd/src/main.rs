//! routemuxd - the routing registry daemon.
//!
//! Loads configuration, opens the selected storage back-end (running any
//! pending migrations), seeds the default router group, and serves the
//! gateway until interrupted.
//!
//! Exit codes: 0 normal, 1 startup failure, 2 migration failure.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use routemux_core::{RouterGroup, RoutingStore};
use routemux_gateway::{GatewayConfig, GatewayServer};
use routemux_storage::kv::{KvRoutingStore, KvStoreConfig};
use routemux_storage::sql::{SqlRoutingStore, SqlStoreConfig};

use config::{Backend, Config};

const EXIT_STARTUP_FAILURE: u8 = 1;
const EXIT_MIGRATION_FAILURE: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "routemuxd", about = "routing registry control plane", version)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen port
    #[arg(long)]
    port: Option<u16>,

    /// Override the SQLite database path
    #[arg(long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("routemuxd: {err:#}");
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    if let Some(database) = args.database {
        config.database_path = database;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_filter.clone())),
        )
        .init();

    let store = match open_store(&config) {
        Ok(store) => store,
        Err(OpenStoreError::Migration(err)) => {
            error!("[Startup] migration failed: {err}");
            return ExitCode::from(EXIT_MIGRATION_FAILURE);
        }
        Err(OpenStoreError::Other(err)) => {
            error!("[Startup] failed to open storage back-end: {err:#}");
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };

    if config.seed_default_router_group {
        if let Err(err) = seed_router_groups(store.as_ref()).await {
            error!("[Startup] failed to seed router groups: {err:#}");
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    }

    let gateway = GatewayServer::new(
        GatewayConfig {
            host: config.listen_host.clone(),
            port: config.listen_port,
            enable_cors: config.enable_cors,
        },
        store.clone(),
    );

    info!(
        "[Startup] routemuxd serving on {}:{} ({} back-end)",
        config.listen_host,
        config.listen_port,
        match config.backend {
            Backend::Sqlite => "sqlite",
            Backend::Memory => "memory",
        }
    );

    let server = gateway.spawn();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("[Shutdown] interrupt received, closing watches");
            store.cancel_watches();
            ExitCode::SUCCESS
        }
        result = server => match result {
            Ok(Ok(())) => ExitCode::SUCCESS,
            Ok(Err(err)) => {
                error!("[Gateway] server failed: {err}");
                ExitCode::from(EXIT_STARTUP_FAILURE)
            }
            Err(err) => {
                error!("[Gateway] server task panicked: {err}");
                ExitCode::from(EXIT_STARTUP_FAILURE)
            }
        }
    }
}

enum OpenStoreError {
    Migration(routemux_storage::StoreInitError),
    Other(anyhow::Error),
}

fn open_store(config: &Config) -> Result<Arc<dyn RoutingStore>, OpenStoreError> {
    match config.backend {
        Backend::Sqlite => {
            let store_config = SqlStoreConfig {
                default_ttl_secs: config.default_ttl_secs,
                hub_capacity: config.hub_capacity,
                max_sweep_interval: Duration::from_millis(config.max_sweep_interval_ms),
            };
            match SqlRoutingStore::open(&config.database_path, store_config) {
                Ok(store) => Ok(Arc::new(store)),
                Err(err) if err.is_migration_failure() => Err(OpenStoreError::Migration(err)),
                Err(err) => Err(OpenStoreError::Other(err.into())),
            }
        }
        Backend::Memory => Ok(Arc::new(KvRoutingStore::new(KvStoreConfig {
            default_ttl_secs: config.default_ttl_secs,
            hub_capacity: config.hub_capacity,
        }))),
    }
}

/// First-startup seeding: when no router groups exist yet, create the
/// default tcp group so TCP upserts have something to reference.
async fn seed_router_groups(store: &dyn RoutingStore) -> anyhow::Result<()> {
    let existing = store
        .read_router_groups()
        .await
        .context("reading router groups")?;
    if !existing.is_empty() {
        return Ok(());
    }

    let group = RouterGroup::default_tcp();
    info!(
        "[Startup] seeding router group '{}' ({})",
        group.name, group.reservable_ports
    );
    store
        .save_router_group(group)
        .await
        .context("saving default router group")?;
    Ok(())
}
