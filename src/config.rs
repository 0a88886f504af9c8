//! Configuration for molproxy.
//!
//! Settings are read from `~/.molproxy/config.toml` unless another file is
//! given with `--config`. Every key is optional:
//!
//! ```toml
//! log_level = "info"
//!
//! [engine]
//! command = ["pymol", "-p", "-q", "-i", "-x", "-K"]
//! prompt = "PyMOL>"
//! io_timeout_ms = 30000
//!
//! [render]
//! idle_timeout_ms = 10
//! auto_format = "ppm"        # png, bmp or ppm
//!
//! [tuning]
//! pan_sensitivity = 0.05
//!
//! [shutdown]
//! grace_ms = 5000
//!
//! [files]
//! stats_file = "/var/tmp/visservers/data.xml"
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::child::ShutdownPolicy;
use crate::proxy::frame::ImageFormat;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log filter (`RUST_LOG` syntax)
    pub log_level: String,
    pub engine: EngineConfig,
    pub client: ClientConfig,
    pub render: RenderConfig,
    pub tuning: TuningConfig,
    pub shutdown: ShutdownConfig,
    pub files: FilesConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            engine: EngineConfig::default(),
            client: ClientConfig::default(),
            render: RenderConfig::default(),
            tuning: TuningConfig::default(),
            shutdown: ShutdownConfig::default(),
            files: FilesConfig::default(),
        }
    }
}

/// Render engine process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Program and arguments
    pub command: Vec<String>,
    /// Start of the line the engine prints when ready for input
    pub prompt: String,
    /// Longest wait for one engine answer
    pub io_timeout_ms: u64,
    /// Engine stdout read window
    pub buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: ["pymol", "-p", "-q", "-i", "-x", "-K"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            prompt: "PyMOL>".to_string(),
            io_timeout_ms: 30_000,
            buffer_size: 1 << 18,
        }
    }
}

/// Client connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub buffer_size: usize,
    /// Longest single line accepted from the client
    pub max_line_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1 << 16,
            max_line_bytes: 1 << 24,
        }
    }
}

/// Frame production
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Quiet period after which a pending render is captured
    pub idle_timeout_ms: u64,
    /// Format of renders triggered by the proxy itself
    pub auto_format: ImageFormat,
    /// First word of every frame header
    pub image_marker: String,
    /// Line sent to the client on startup; nothing by default
    pub greeting: Option<String>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 10,
            auto_format: ImageFormat::Ppm,
            image_marker: "nv>image".to_string(),
            greeting: None,
        }
    }
}

/// Scaling constants for client commands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    /// Engine units per client pan unit
    pub pan_sensitivity: f64,
    /// `atomscale` value when none is given
    pub default_atom_scale: f64,
    /// `bondthickness` value when none is given
    pub default_bond_thickness: f64,
    /// `label` size when `-size` is not given
    pub label_size: i32,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            pan_sensitivity: 0.05,
            default_atom_scale: 0.25,
            default_bond_thickness: 0.25,
            label_size: 14,
        }
    }
}

/// Engine shutdown timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub grace_ms: u64,
    pub kill_wait_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_ms: 5_000,
            kill_wait_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    /// Directory for the uploaded PDB file and the default log
    pub temp_dir: Option<PathBuf>,
    /// Session records are appended here; an empty path disables them
    pub stats_file: PathBuf,
    pub log_file: Option<PathBuf>,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            temp_dir: None,
            stats_file: PathBuf::from("/var/tmp/visservers/data.xml"),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the default location.
    ///
    /// A missing default file yields the built-in defaults; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from(path),
            None => match Self::config_path() {
                Some(path) if path.exists() => Self::load_from(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Get config file path
    fn config_path() -> Option<PathBuf> {
        home_dir().map(|home| home.join(".molproxy").join("config.toml"))
    }

    pub fn stats_file(&self) -> Option<&Path> {
        let path = self.files.stats_file.as_path();
        (!path.as_os_str().is_empty()).then_some(path)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.files.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Per-process file that `loadpdb` writes.
    pub fn pdb_path(&self) -> PathBuf {
        self.temp_dir().join(format!("molproxy{}.pdb", std::process::id()))
    }

    pub fn log_path(&self) -> PathBuf {
        self.files
            .log_file
            .clone()
            .unwrap_or_else(|| self.temp_dir().join(format!("molproxy{}.log", std::process::id())))
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.engine.io_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.render.idle_timeout_ms)
    }

    pub fn shutdown_policy(&self) -> ShutdownPolicy {
        ShutdownPolicy {
            grace: Duration::from_millis(self.shutdown.grace_ms),
            kill_wait: Duration::from_millis(self.shutdown.kill_wait_ms),
            ..ShutdownPolicy::default()
        }
    }
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
