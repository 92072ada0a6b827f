//! Core daemon configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file (or
//! no file at all) yields a working daemon with an empty application
//! catalog. The catalog tables live in the same file, flattened at the top
//! level.

use std::path::{Path, PathBuf};

use marshal_ipc::framing::{FramingMode, DEFAULT_MAX_FRAME_SIZE};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::catalog::ApplicationCatalog;

pub const DEFAULT_TRAY_ADDRESS: &str = "127.0.0.1:5000";
pub const DEFAULT_GUI_ADDRESS: &str = "127.0.0.1:19850";
pub const DEFAULT_LIVENESS_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Listener for Tray connections.
    pub tray_address: String,
    /// Listener for GUI connections.
    pub gui_address: String,
    pub max_frame_size: usize,
    /// Tray connections may come from senders predating the framing, so the
    /// Tray listener defaults to auto-detection. GUI connections are always
    /// framed.
    pub tray_framing: FramingMode,
    /// Seconds between liveness sweeps over the registry.
    pub liveness_interval_secs: u64,
    #[serde(flatten)]
    pub catalog: ApplicationCatalog,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            tray_address: DEFAULT_TRAY_ADDRESS.to_string(),
            gui_address: DEFAULT_GUI_ADDRESS.to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            tray_framing: FramingMode::Auto,
            liveness_interval_secs: DEFAULT_LIVENESS_INTERVAL_SECS,
            catalog: ApplicationCatalog::default(),
        }
    }
}

impl CoreConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `<platform config dir>/marshal/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("marshal").join("config.toml"))
    }

    /// Loads the default config file if one exists, built-in defaults
    /// otherwise.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from_file(&path),
            _ => {
                debug!("no config file found, using defaults");
                Ok(Self::default())
            }
        }
    }
}
