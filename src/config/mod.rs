//! Control plane configuration
//!
//! Read from `~/.minik8s/config.yaml` unless another file is given. Every
//! field has a default, so an empty or missing file is a valid config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::{
    ControllerConfig, CONTROL_PLANE_PORT, RECONCILE_INTERVAL_SECS, REMOTE_CALL_TIMEOUT_MS,
};

/// Default config file location: ~/.minik8s/config.yaml
pub fn default_config_path() -> PathBuf {
    minik8s_home().join("config.yaml")
}

/// Default state file location: ~/.minik8s/state.json
pub fn default_store_path() -> PathBuf {
    minik8s_home().join("state.json")
}

fn minik8s_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".minik8s")
}

/// Errors loading the configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Settings of the control plane process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Address the API binds to
    #[serde(rename = "bindAddr")]
    #[serde(default = "default_bind_address")]
    pub bind_addr: String,

    /// API port
    #[serde(default = "default_port")]
    pub port: u16,

    /// URL workers use to reach the control plane.
    /// Defaults to `http://<bindAddr>:<port>`.
    #[serde(rename = "advertiseAddress")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_address: Option<String>,

    /// Seconds between deployment reconciliation passes
    #[serde(rename = "reconcileIntervalSeconds")]
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Timeout of every worker call in milliseconds
    #[serde(rename = "remoteTimeoutMillis")]
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout_ms: u64,

    /// State file. Without one, state lives in memory only.
    #[serde(rename = "storePath")]
    #[serde(default = "default_store_path_option")]
    pub store_path: Option<PathBuf>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_address(),
            port: default_port(),
            advertise_address: None,
            reconcile_interval_secs: default_reconcile_interval(),
            remote_timeout_ms: default_remote_timeout(),
            store_path: default_store_path_option(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    CONTROL_PLANE_PORT
}

fn default_reconcile_interval() -> u64 {
    RECONCILE_INTERVAL_SECS
}

fn default_remote_timeout() -> u64 {
    REMOTE_CALL_TIMEOUT_MS
}

fn default_store_path_option() -> Option<PathBuf> {
    Some(default_store_path())
}

impl ControlPlaneConfig {
    /// `bindAddr:port`
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn advertise_url(&self) -> String {
        self.advertise_address
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.bind_addr, self.port))
    }

    /// Reject values the control loops cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconcile_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "reconcileIntervalSeconds must be at least 1".to_string(),
            ));
        }
        if self.remote_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "remoteTimeoutMillis must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs),
            remote_timeout: Duration::from_millis(self.remote_timeout_ms),
            advertise_address: self.advertise_url(),
        }
    }
}

// ============================================================================
// SBIO: Pure parsing (no I/O)
// ============================================================================

/// Parse config from a YAML string
pub fn parse_config(content: &str) -> Result<ControlPlaneConfig, ConfigError> {
    if content.trim().is_empty() {
        return Ok(ControlPlaneConfig::default());
    }
    let config: ControlPlaneConfig =
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Load the config from an explicit path, which must exist
pub fn load_config_from(path: &Path) -> Result<ControlPlaneConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Load the config from the default location, falling back to defaults
pub fn load_config() -> Result<ControlPlaneConfig, ConfigError> {
    let path = default_config_path();
    if !path.exists() {
        return Ok(ControlPlaneConfig::default());
    }
    load_config_from(&path)
}
