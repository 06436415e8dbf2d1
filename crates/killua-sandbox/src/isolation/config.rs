//! Configuration for process isolation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SandboxError};
use crate::wasm::WasmConfig;

/// Settings for spawning and supervising workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    /// Worker executable (default = the current executable)
    pub worker_program: Option<PathBuf>,

    /// Arguments passed to the worker executable
    pub worker_args: Vec<String>,

    /// Wall-clock budget per invocation in milliseconds
    pub timeout_ms: u64,

    /// Runtime settings forwarded to the worker
    pub wasm: WasmConfig,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            worker_program: None,
            worker_args: vec!["worker".to_string()],
            timeout_ms: 10_000, // 10 s
            wasm: WasmConfig::default(),
        }
    }
}

impl IsolationConfig {
    /// Load a config from a JSON file. Missing fields take default values.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| SandboxError::ConfigError(format!("{}: {}", path.display(), e)))
    }

    /// The per-invocation budget.
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Builder: set the worker executable and its arguments
    pub fn worker(mut self, program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.worker_program = Some(program.into());
        self.worker_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set the per-invocation budget
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis().min(u128::from(u64::MAX)) as u64;
        self
    }

    /// Builder: set the runtime settings
    pub fn wasm(mut self, wasm: WasmConfig) -> Self {
        self.wasm = wasm;
        self
    }

    /// Resolve the worker executable.
    pub fn worker_program(&self) -> Result<PathBuf> {
        match &self.worker_program {
            Some(program) => Ok(program.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }
}
