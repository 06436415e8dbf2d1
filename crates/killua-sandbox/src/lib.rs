//! # Killua Sandbox
//!
//! Runs untrusted WebAssembly guests for user-supplied custom commands.
//!
//! The crate is layered so each piece can be used on its own:
//!
//! | Layer | Module | Role |
//! |-------|--------|------|
//! | Marshalling | [`wasm`] | Typed values, memory view, binding trees, host function stubs |
//! | Imports | [`wasm::WasiShim`], [`wasm::Bridge`] | Minimal WASI and the `env` application API |
//! | Transport | [`ipc`] | Framed pipe protocol between parent and worker |
//! | Isolation | [`isolation`] | One worker process per invocation, with timeout and kill |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use futures::StreamExt;
//! use killua_sandbox::{IsolationConfig, Outcome, SandboxRunner};
//!
//! // Compile once at startup
//! let runner = SandboxRunner::new(IsolationConfig::default(), "guest.wasm")?;
//!
//! // Each invocation runs in its own worker process
//! let mut replies = runner.run_sandboxed("print('hi')");
//! while let Some(reply) = replies.next().await {
//!     println!("{}", reply);
//! }
//! assert_eq!(replies.outcome().await, Outcome::Completed);
//! ```
//!
//! The binary that embeds the runner must dispatch its `worker` subcommand
//! to [`worker::serve_stdio`], or point [`IsolationConfig::worker`] at one
//! that does.
//!
//! ## Features
//!
//! - `process` - Framed pipes and worker processes (nix, tokio, futures, postcard)
//! - `wasm` - Guest execution (wasmtime)
//! - `full` - All features enabled

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod source;

#[cfg(feature = "process")]
pub mod ipc;

#[cfg(feature = "wasm")]
pub mod wasm;

#[cfg(all(feature = "process", feature = "wasm"))]
pub mod worker;

#[cfg(all(feature = "process", feature = "wasm"))]
pub mod isolation;

// Re-export main types
pub use error::{ErrorCategory, Result, SandboxError};
pub use source::{SourceCode, MAX_SOURCE_LEN};

#[cfg(feature = "wasm")]
pub use wasm::{Bridge, ContextIds, ReplySink, WasiShim, WasmConfig, WasmInstance, WasmModule, WasmSandbox};

#[cfg(all(feature = "process", feature = "wasm"))]
pub use isolation::{IsolationConfig, Outcome, ReplyStream, SandboxRunner, Session, SessionState};

#[cfg(all(feature = "process", feature = "wasm"))]
pub use worker::WorkerExit;
