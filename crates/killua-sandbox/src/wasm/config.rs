//! Configuration for the WASM runtime.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SandboxError};

/// Configuration for the WASM sandbox runtime.
///
/// The worker rebuilds its engine from this, so a module serialized by the
/// parent deserializes against matching engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WasmConfig {
    /// Maximum linear memory in bytes (default = 64MB)
    pub max_memory: usize,

    /// Enable fuel-based execution limiting
    pub fuel_limit: Option<u64>,

    /// Cranelift optimization level (0-2)
    pub optimization_level: u8,

    /// Enable SIMD support
    pub enable_simd: bool,

    /// Wasmtime cache config file for compiled modules
    pub cache_path: Option<PathBuf>,

    /// Export called to run the guest
    pub entry_point: String,

    /// Copy guest stdout/stderr writes to the host streams
    pub echo_output: bool,
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            max_memory: 64 * 1024 * 1024, // 64 MB
            fuel_limit: None,
            optimization_level: 2,
            enable_simd: true,
            cache_path: None,
            entry_point: "main".to_string(),
            echo_output: false,
        }
    }
}

impl WasmConfig {
    /// Create a minimal config for maximum isolation
    pub fn minimal() -> Self {
        Self {
            max_memory: 16 * 1024 * 1024,    // 16 MB
            fuel_limit: Some(1_000_000_000), // 1B fuel units
            enable_simd: false,
            ..Default::default()
        }
    }

    /// Create config for development/debugging
    pub fn development() -> Self {
        Self {
            optimization_level: 0, // Faster compilation
            echo_output: true,
            ..Default::default()
        }
    }

    /// Load a config from a JSON file. Missing fields take default values.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| SandboxError::ConfigError(format!("{}: {}", path.display(), e)))
    }

    /// Builder: set max memory
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Builder: set fuel limit
    pub fn fuel_limit(mut self, fuel: u64) -> Self {
        self.fuel_limit = Some(fuel);
        self
    }

    /// Builder: enable SIMD
    pub fn simd(mut self, enable: bool) -> Self {
        self.enable_simd = enable;
        self
    }

    /// Builder: set optimization level
    pub fn optimize(mut self, level: u8) -> Self {
        self.optimization_level = level.min(2);
        self
    }

    /// Builder: set cache path
    pub fn cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    /// Builder: set entry point export
    pub fn entry_point(mut self, name: impl Into<String>) -> Self {
        self.entry_point = name.into();
        self
    }

    /// Builder: echo guest output
    pub fn echo_output(mut self, echo: bool) -> Self {
        self.echo_output = echo;
        self
    }
}
