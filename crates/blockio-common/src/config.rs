//! Configuration types for BlockIO
//!
//! This module defines configuration structures used across components.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default size of a short-circuit packet (8 MB)
pub const DEFAULT_PACKET_SIZE: usize = 8 * 1024 * 1024;

/// Root configuration for BlockIO
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Short-circuit read configuration
    #[serde(default)]
    pub short_circuit: ShortCircuitConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::configuration(format!("failed to render config: {e}")))
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.short_circuit.packet_size == 0 {
            return Err(Error::configuration("short_circuit.packet_size must be > 0"));
        }
        Ok(())
    }
}

/// Short-circuit (local) read configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShortCircuitConfig {
    /// Read co-located blocks straight from the local filesystem
    pub enabled: bool,
    /// Bytes per packet handed to the reader
    pub packet_size: usize,
    /// Memory backing packet buffers
    pub buffer_type: BufferType,
}

impl Default for ShortCircuitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            packet_size: DEFAULT_PACKET_SIZE,
            buffer_type: BufferType::Heap,
        }
    }
}

/// Memory backing a packet buffer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferType {
    /// Ordinary heap memory, reclaimed on drop
    #[default]
    Heap,
    /// Aligned allocation outside the heap allocator's pools, freed explicitly
    Direct,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Per-stream options for block input streams
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InStreamOptions {
    packet_size: usize,
    buffer_type: BufferType,
}

impl InStreamOptions {
    /// Derive stream options from the client configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.short_circuit.packet_size, config.short_circuit.buffer_type)
    }

    pub fn new(packet_size: usize, buffer_type: BufferType) -> Result<Self> {
        if packet_size == 0 {
            return Err(Error::configuration("packet size must be > 0"));
        }
        Ok(Self {
            packet_size,
            buffer_type,
        })
    }

    /// Bytes per packet; never zero
    #[must_use]
    pub const fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Memory backing packet buffers
    #[must_use]
    pub const fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }
}

impl Default for InStreamOptions {
    fn default() -> Self {
        Self {
            packet_size: DEFAULT_PACKET_SIZE,
            buffer_type: BufferType::Heap,
        }
    }
}
