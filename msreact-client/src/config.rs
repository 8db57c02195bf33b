//! Client configuration and per-algorithm configuration files.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::{
    error::ConfigError,
    transfer_register,
    transport::{TransportConfig, DEFAULT_PORT, DEFAULT_SERVICE},
};

/// Where acquisitions are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// In a child process running the hidden `acquisition-worker` subcommand.
    #[default]
    Process,
    /// On a blocking thread of the client process.
    Thread,
}

/// Settings of a client session. Every field has a default so a partial JSON
/// file is enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub port: u16,
    pub service: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
    pub response_timeout_ms: Option<u64>,
    pub intra_join_timeout_ms: u64,
    pub worker_mode: WorkerMode,
    pub transfer_register: PathBuf,
    pub download_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            service: DEFAULT_SERVICE.to_string(),
            max_reconnect_attempts: 3,
            reconnect_backoff_ms: 500,
            response_timeout_ms: None,
            intra_join_timeout_ms: 30_000,
            worker_mode: WorkerMode::default(),
            transfer_register: PathBuf::from(transfer_register::DEFAULT_FILE_NAME),
            download_dir: PathBuf::from("."),
        }
    }
}

impl ClientConfig {
    /// Read a configuration file, or use the defaults when no path is given.
    ///
    /// # Errors
    /// [`ConfigError`] if the file cannot be read or parsed.
    #[instrument]
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        debug!("loaded client configuration: {config:?}");
        Ok(config)
    }

    #[must_use]
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            port: self.port,
            service: self.service.clone(),
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms),
        }
    }

    #[must_use]
    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub const fn intra_join_timeout(&self) -> Duration {
        Duration::from_millis(self.intra_join_timeout_ms)
    }
}

/// Check that `path` points to an existing `.json` file.
///
/// # Errors
/// [`ConfigError::InvalidPath`] otherwise.
pub fn validate_config_path(path: &Path) -> Result<(), ConfigError> {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    if is_json && path.is_file() {
        Ok(())
    } else {
        Err(ConfigError::InvalidPath {
            path: path.to_path_buf(),
        })
    }
}

/// Load the configuration of an algorithm. `None` in, `None` out.
///
/// # Errors
/// [`ConfigError`] if the file cannot be read, is not JSON, or does not hold an
/// object at the top level.
pub fn load_algorithm_config(
    path: Option<&Path>,
) -> Result<Option<Map<String, Value>>, ConfigError> {
    let Some(path) = path else {
        return Ok(None);
    };
    let raw = fs::read_to_string(path)?;
    match serde_json::from_str::<Value>(&raw)? {
        Value::Object(map) => Ok(Some(map)),
        _ => Err(ConfigError::NotAnObject {
            path: path.to_path_buf(),
        }),
    }
}
