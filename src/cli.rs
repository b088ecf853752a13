use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::config::ControlPlaneConfig;

#[derive(Parser, Debug)]
#[command(name = "minik8s")]
#[command(about = "Run the minik8s cluster control plane")]
#[command(version)]
pub struct Args {
    /// Path to the config file (YAML). Defaults to ~/.minik8s/config.yaml
    #[arg(short, long, value_name = "FILE", env = "MINIK8S_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Override the bind address of the API
    #[arg(long, value_name = "ADDR", env = "MINIK8S_BIND_ADDR")]
    pub bind_addr: Option<String>,

    /// Override the API port
    #[arg(short, long, value_name = "PORT", env = "MINIK8S_PORT")]
    pub port: Option<u16>,

    /// URL workers should use to reach this control plane
    #[arg(long, value_name = "URL", env = "MINIK8S_ADVERTISE_ADDRESS")]
    pub advertise_address: Option<String>,

    /// Override the state file
    #[arg(long, value_name = "FILE", env = "MINIK8S_STORE", conflicts_with = "in_memory")]
    pub store: Option<PathBuf>,

    /// Keep cluster state in memory only
    #[arg(long)]
    pub in_memory: bool,

    /// Seconds between deployment reconciliation passes
    #[arg(long, value_name = "SECS", env = "MINIK8S_RECONCILE_INTERVAL")]
    pub reconcile_interval: Option<u64>,

    /// Timeout of every worker call in milliseconds
    #[arg(long, value_name = "MILLIS", env = "MINIK8S_REMOTE_TIMEOUT")]
    pub remote_timeout: Option<u64>,

    /// Path to a .env file to load before reading the environment
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}

impl Args {
    /// Apply command line overrides on top of the file config
    pub fn apply_overrides(&self, config: &mut ControlPlaneConfig) {
        if let Some(ref bind_addr) = self.bind_addr {
            config.bind_addr = bind_addr.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(ref advertise) = self.advertise_address {
            config.advertise_address = Some(advertise.clone());
        }
        if let Some(ref store) = self.store {
            config.store_path = Some(store.clone());
        }
        if self.in_memory {
            config.store_path = None;
        }
        if let Some(secs) = self.reconcile_interval {
            config.reconcile_interval_secs = secs;
        }
        if let Some(millis) = self.remote_timeout {
            config.remote_timeout_ms = millis;
        }
    }
}
