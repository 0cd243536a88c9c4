use std::fs;
use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::bridge::InitPolicy;

const CONFIG_ENV: &str = "WEBVIEW_BRIDGE_CONFIG";
const CONFIG_FILE: &str = "bridge.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read bridge config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Name of the transport function bound on the surface.
    pub binding_name: String,
    /// Mutation watcher polling interval.
    pub poll_interval_ms: u64,
    pub init_policy: InitPolicy,
    /// Console lines kept by the QuickJS surface.
    pub console_capacity: usize,
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            binding_name: "__bridgeInternal".to_string(),
            poll_interval_ms: 25,
            init_policy: InitPolicy::Roots,
            console_capacity: 256,
            log_filter: "info".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Read `config_path` if it exists, otherwise fall back to defaults.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        match config_path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)?;
                Ok(serde_yaml::from_str(&contents)?)
            }
            _ => Ok(Self::default()),
        }
    }

    /// `$WEBVIEW_BRIDGE_CONFIG`, then `bridge.yaml` in the user config
    /// directory, then defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .or_else(default_config_path);
        Self::load(path)
    }
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "WebviewBridge", "WebviewBridge")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}
