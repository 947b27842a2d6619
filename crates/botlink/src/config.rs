use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Whole-system settings. Every field has a default, so an absent file or an
/// empty table is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub ipc: IpcConfig,
    pub worker: WorkerConfig,
    pub gateway: GatewayConfig,
    pub supervisor: SupervisorConfig,
    pub store: StoreLimits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IpcConfig {
    pub command_socket: PathBuf,
    pub callback_socket: PathBuf,
    pub reply_timeout_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            command_socket: PathBuf::from("/tmp/botlink-cmd.sock"),
            callback_socket: PathBuf::from("/tmp/botlink-callback.sock"),
            reply_timeout_ms: 10_000,
        }
    }
}

impl IpcConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub storage_dir: PathBuf,
    pub execution_budget_ms: u64,
    pub stop_grace_ms: u64,
    /// Where `send_agent` lines go. `None` turns them into no-ops.
    pub agent_endpoint: Option<SocketAddr>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./storage/projects"),
            execution_budget_ms: 300_000,
            stop_grace_ms: 2_000,
            agent_endpoint: Some(SocketAddr::from(([127, 0, 0, 1], 5566))),
        }
    }
}

impl WorkerConfig {
    pub fn execution_budget(&self) -> Duration {
        Duration::from_millis(self.execution_budget_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    pub reconnect_window_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8000)),
            reconnect_window_ms: 2_000,
        }
    }
}

impl GatewayConfig {
    pub fn reconnect_window(&self) -> Duration {
        Duration::from_millis(self.reconnect_window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    pub shutdown_grace_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// A run at least this long resets the backoff.
    pub stable_after_ms: u64,
    pub restart_gateway: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: 5_000,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
            stable_after_ms: 10_000,
            restart_gateway: false,
        }
    }
}

impl SupervisorConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Limits applied to uploaded archives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreLimits {
    pub max_archive_bytes: u64,
    pub max_uncompressed_bytes: u64,
    pub max_files: usize,
    pub max_compression_ratio: u64,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_archive_bytes: 20 * 1024 * 1024,
            max_uncompressed_bytes: 100 * 1024 * 1024,
            max_files: 10,
            max_compression_ratio: 100,
        }
    }
}

impl Config {
    /// Load `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents =
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
