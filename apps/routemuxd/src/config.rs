//! Daemon configuration - a TOML file with command-line overrides.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Which storage back-end the daemon runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Relational store in a SQLite file, swept in the background.
    Sqlite,
    /// Embedded KV store with native TTL leases (non-durable).
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Interface the gateway binds.
    pub listen_host: String,
    /// Port the gateway binds.
    pub listen_port: u16,
    /// Enable permissive CORS on the gateway.
    pub enable_cors: bool,

    /// Storage back-end.
    pub backend: Backend,
    /// SQLite database file (sqlite back-end only).
    pub database_path: PathBuf,

    /// TTL applied to upserts that omit one, in seconds.
    pub default_ttl_secs: u64,
    /// Per-subscriber event buffer capacity.
    pub hub_capacity: usize,
    /// Upper bound on the sweeper interval, in milliseconds.
    pub max_sweep_interval_ms: u64,

    /// Create the default-tcp router group on first startup when no
    /// groups exist. Disable when an external bootstrap owns seeding.
    pub seed_default_router_group: bool,

    /// tracing env-filter expression, e.g. `info` or
    /// `routemux_storage=debug,info`.
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 3000,
            enable_cors: false,
            backend: Backend::Sqlite,
            database_path: PathBuf::from("routemux.db"),
            default_ttl_secs: 120,
            hub_capacity: 1024,
            max_sweep_interval_ms: 1000,
            seed_default_router_group: true,
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            None => Ok(Self::default()),
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("failed to parse config file {}", path.display()))
            }
        }
    }
}
