//! Process isolation boundary.
//!
//! A [`SandboxRunner`] compiles the guest once and runs every invocation in a
//! fresh worker process:
//!
//! ```text
//! parent                                   worker (killua worker)
//!   SandboxRunner::spawn ──── Job ────────▶ deserialize, instantiate
//!                         ◀── Reply ─────── message_reply
//!                         ◀── Reply ─────── message_reply
//!                         ◀── close ─────── guest returned
//!   reap exit status ◀──────────────────── exit(0 | 70 | 71 | 72)
//! ```
//!
//! The parent never blocks past the configured budget. On expiry it kills
//! the worker and reports [`Outcome::TimedOut`].
//!
//! [`SandboxRunner::run_sandboxed`] wraps a session in a [`ReplyStream`];
//! [`SandboxRunner::spawn`] hands out the session itself.

mod config;
mod session;
mod stream;

use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;

pub use config::IsolationConfig;
pub use session::{Outcome, Session, SessionState};
pub use stream::ReplyStream;

use crate::error::{Result, SandboxError};
use crate::ipc::Job;
use crate::source::SourceCode;
use crate::wasm::{ContextIds, WasmModule, WasmSandbox};

/// Runs one guest module in isolated workers.
///
/// Cheap to share: the serialized module is reference counted.
#[derive(Debug, Clone)]
pub struct SandboxRunner {
    config: IsolationConfig,
    name: String,
    module: Arc<Vec<u8>>,
}

impl SandboxRunner {
    /// Compile the guest module at `module_path`.
    pub fn new(config: IsolationConfig, module_path: impl AsRef<Path>) -> Result<Self> {
        let sandbox = WasmSandbox::new(config.wasm.clone())?;
        let module = sandbox.load_module(module_path)?;
        Self::prepare(config, &sandbox, &module)
    }

    /// Compile a guest module from binary or text bytes.
    pub fn from_bytes(config: IsolationConfig, name: &str, bytes: &[u8]) -> Result<Self> {
        let sandbox = WasmSandbox::new(config.wasm.clone())?;
        let module = sandbox.load_module_bytes(name, bytes)?;
        Self::prepare(config, &sandbox, &module)
    }

    fn prepare(config: IsolationConfig, sandbox: &WasmSandbox, module: &WasmModule) -> Result<Self> {
        let missing = sandbox.check_imports(module)?;
        if let Some(first) = missing.into_iter().next() {
            return Err(first.into());
        }

        let serialized = sandbox.serialize_module(module)?;
        tracing::info!(module = module.name(), bytes = serialized.len(), "guest module compiled");
        Ok(Self {
            config,
            name: module.name().to_string(),
            module: Arc::new(serialized),
        })
    }

    /// Runner settings.
    pub fn config(&self) -> &IsolationConfig {
        &self.config
    }

    /// Guest module name.
    pub fn module_name(&self) -> &str {
        &self.name
    }

    /// Start one invocation with default message ids.
    ///
    /// Fails with [`SandboxError::TooLarge`] before any process starts when
    /// the snippet is over the cap.
    pub async fn spawn(&self, source: &str) -> Result<Session> {
        self.spawn_for(source, ContextIds::default()).await
    }

    /// Start one invocation triggered by the message `context` names.
    pub async fn spawn_for(&self, source: &str, context: ContextIds) -> Result<Session> {
        let source = SourceCode::parse(source)?;
        let job = Job {
            config: self.config.wasm.clone(),
            module: Cow::Borrowed(self.module.as_slice()),
            source: Cow::Borrowed(source.as_str()),
            context,
        };
        Session::start(&self.config, &job).await
    }

    /// Run `source` in a fresh worker and stream its replies.
    ///
    /// Refused invocations yield no replies and a faulted outcome.
    ///
    /// # Panics
    ///
    /// Outside a Tokio runtime.
    pub fn run_sandboxed(&self, source: &str) -> ReplyStream {
        self.run_sandboxed_for(source, ContextIds::default())
    }

    /// [`run_sandboxed`](Self::run_sandboxed) for the message `context` names.
    pub fn run_sandboxed_for(&self, source: &str, context: ContextIds) -> ReplyStream {
        ReplyStream::start(self.clone(), source.to_string(), context)
    }
}

impl From<SandboxError> for Outcome {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Timeout(_) => Outcome::TimedOut,
            other => Outcome::Faulted { reason: other.to_string() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_IMPORTS: &str = r#"(module (memory (export "memory") 1) (func (export "main")))"#;

    #[test]
    fn test_runner_rejects_unknown_import() {
        let wat = r#"(module (import "env" "launch_missiles" (func)) (func (export "main")))"#;
        let err = SandboxRunner::from_bytes(IsolationConfig::default(), "bad", wat.as_bytes()).unwrap_err();
        assert!(matches!(err, SandboxError::UnresolvedImport { ref name, .. } if name == "launch_missiles"));
        assert_eq!(err.category(), crate::error::ErrorCategory::Configuration);
    }

    #[test]
    fn test_runner_is_shareable() {
        let runner = SandboxRunner::from_bytes(IsolationConfig::default(), "empty", NO_IMPORTS.as_bytes()).unwrap();
        let copy = runner.clone();
        assert!(Arc::ptr_eq(&runner.module, &copy.module));
        assert_eq!(copy.module_name(), "empty");
    }

    #[tokio::test]
    async fn test_oversized_source_is_faulted_without_spawning() {
        let config = IsolationConfig::default().worker("/nonexistent/worker", Vec::<String>::new());
        let runner = SandboxRunner::from_bytes(config, "empty", NO_IMPORTS.as_bytes()).unwrap();
        let source = "x".repeat(crate::source::MAX_SOURCE_LEN + 1);
        assert!(matches!(runner.spawn(&source).await, Err(SandboxError::TooLarge { .. })));

        let mut stream = runner.run_sandboxed(&source);
        assert_eq!(stream.next_reply().await, None);
        assert!(matches!(stream.outcome().await, Outcome::Faulted { .. }));
    }

    #[tokio::test]
    async fn test_missing_worker_binary_is_faulted() {
        let config = IsolationConfig::default().worker("/nonexistent/worker", Vec::<String>::new());
        let runner = SandboxRunner::from_bytes(config, "empty", NO_IMPORTS.as_bytes()).unwrap();
        let outcome = runner.run_sandboxed("print('hi')").outcome().await;
        assert!(!outcome.is_completed());
    }

    #[test]
    fn test_error_to_outcome() {
        let timeout = SandboxError::Timeout(std::time::Duration::from_secs(1));
        assert_eq!(Outcome::from(timeout), Outcome::TimedOut);
        assert!(matches!(Outcome::from(SandboxError::Disconnected), Outcome::Faulted { .. }));
    }
}
