//! Engine and loopback configuration.
//!
//! ```toml
//! [engine]
//! num_buffers = 4
//! buffer_size = 524288
//! request_timeout_ms = 5000
//! buffer_timeout_ms = 5000
//! device_mapping = false
//!
//! [loopback]
//! busy_polls = 2
//! ```

use crate::error::{Result, SvcError};
use crate::svc::loopback::LoopbackBehavior;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Number of service buffers
pub const DEFAULT_NUM_BUFFERS: usize = 4;

/// Size of each service buffer
pub const DEFAULT_BUFFER_SIZE: usize = 512 * 1024; // 512KB

/// Deadline for reconfiguration requests. Completion alone takes ~600ms.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;

/// Deadline for a submitted buffer to be acknowledged
pub const DEFAULT_BUFFER_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub num_buffers: usize,
    pub buffer_size: usize,

    /// Probe and initiate timeout; overall deadline for finalize.
    pub request_timeout_ms: u64,

    /// Per-buffer wait while streaming.
    pub buffer_timeout_ms: u64,

    /// Map each buffer for the device before it is submitted.
    pub device_mapping: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_buffers: DEFAULT_NUM_BUFFERS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            buffer_timeout_ms: DEFAULT_BUFFER_TIMEOUT_MS,
            device_mapping: false,
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn buffer_timeout(&self) -> Duration {
        Duration::from_millis(self.buffer_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_buffers == 0 {
            return Err(SvcError::Config("num_buffers must be at least 1".into()));
        }
        if self.buffer_size == 0 {
            return Err(SvcError::Config("buffer_size must be non-zero".into()));
        }
        if self.request_timeout_ms == 0 || self.buffer_timeout_ms == 0 {
            return Err(SvcError::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

/// Contents of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub engine: EngineConfig,
    pub loopback: LoopbackBehavior,
}

impl Config {
    /// `~/.config/fpga-svc/config.toml` on Linux.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("fpga-svc").join("config.toml"))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| SvcError::Config(e.to_string()))?;
        config.engine.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| SvcError::Config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    /// Load `path` if given, else the default file if it exists, else
    /// built-in defaults.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| SvcError::Config(e.to_string()))
    }
}
