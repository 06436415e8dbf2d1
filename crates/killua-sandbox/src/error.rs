//! Error types for the sandbox crate.

use std::time::Duration;

use thiserror::Error;

/// Broad failure class of a [`SandboxError`].
///
/// Configuration errors are fatal at start-up, invocation and protocol errors
/// end a single run, and timeouts are reported separately from faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed binding declaration, unresolved import, bad settings
    Configuration,
    /// Arity mismatch, out-of-bounds access, oversized source, guest trap
    Invocation,
    /// Unexpected frame, read/write after close, undecodable payload
    Protocol,
    /// Wall-clock budget exhausted
    Timeout,
    /// Operating system I/O failure
    Io,
}

/// Sandbox error type
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// A binding tree could not be built from a type declaration
    #[error("malformed binding for `{name}`: {reason}")]
    Binding {
        /// Name of the offending type
        name: String,
        /// What is wrong with it
        reason: String,
    },

    /// The guest module imports something the host does not provide
    #[error("unresolved import {module}.{name}: {reason}")]
    UnresolvedImport {
        /// Import module namespace
        module: String,
        /// Import field name
        name: String,
        /// Missing, or signature mismatch details
        reason: String,
    },

    /// Number of produced or supplied wasm values differs from the signature
    #[error("argument count mismatch: expected {expected}, found {found}")]
    ArgumentCount {
        /// Leaf count required by the binding
        expected: usize,
        /// Leaf count actually supplied
        found: usize,
    },

    /// The value stream ran dry while lifting a value
    #[error("insufficient wasm data while lifting `{type_name}`")]
    InsufficientData {
        /// Type being lifted
        type_name: &'static str,
    },

    /// A wasm value had the wrong kind for its slot
    #[error("wasm type mismatch: expected {expected}, found {found}")]
    KindMismatch {
        /// Kind declared by the signature
        expected: &'static str,
        /// Kind received
        found: &'static str,
    },

    /// A stepped read was asked for with a step of zero
    #[error("slice step cannot be zero")]
    ZeroStep,

    /// Access outside the guest's linear memory
    #[error("memory access out of bounds: offset {offset} length {len} (memory size {size})")]
    OutOfBounds {
        /// Absolute start address
        offset: u64,
        /// Number of bytes requested
        len: u64,
        /// Current memory size in bytes
        size: usize,
    },

    /// A host function ran before the guest memory was bound
    #[error("host function `{0}` called before guest memory was bound")]
    MemoryUnbound(&'static str),

    /// Source snippet exceeds the size cap
    #[error("source too large: {len} bytes (maximum {max})")]
    TooLarge {
        /// Length of the snippet in bytes
        len: usize,
        /// Allowed maximum
        max: usize,
    },

    /// The guest trapped
    #[error("guest trapped: {0}")]
    Trap(String),

    /// The guest called `proc_exit`
    #[error("guest exited with code {0}")]
    ProcExit(i32),

    /// WebAssembly engine error
    #[error("WASM sandbox error: {0}")]
    WasmError(String),

    /// The peer sent an explicit close frame
    #[error("pipe closed by peer")]
    ClosedByPeer,

    /// Send attempted after this side closed the pipe
    #[error("pipe closed locally")]
    ClosedLocally,

    /// Receive attempted after this side closed the pipe
    #[error("pipe closed locally, cannot receive")]
    ReceiveAfterClose,

    /// The peer went away without a close frame
    #[error("pipe disconnected without close")]
    Disconnected,

    /// The byte stream does not follow the framing rules
    #[error("corrupt pipe frame: {0}")]
    Corrupt(String),

    /// A payload could not be encoded or decoded
    #[error("pipe payload codec error: {0}")]
    Codec(String),

    /// Execution budget exhausted
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConfigError(_) | Self::Binding { .. } | Self::UnresolvedImport { .. } => {
                ErrorCategory::Configuration
            }
            Self::ArgumentCount { .. }
            | Self::InsufficientData { .. }
            | Self::KindMismatch { .. }
            | Self::OutOfBounds { .. }
            | Self::ZeroStep
            | Self::MemoryUnbound(_)
            | Self::TooLarge { .. }
            | Self::Trap(_)
            | Self::ProcExit(_)
            | Self::WasmError(_) => ErrorCategory::Invocation,
            Self::ClosedByPeer
            | Self::ClosedLocally
            | Self::ReceiveAfterClose
            | Self::Disconnected
            | Self::Corrupt(_)
            | Self::Codec(_) => ErrorCategory::Protocol,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Io(_) => ErrorCategory::Io,
        }
    }

    /// True for the two ways a reader learns the stream has ended.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::ClosedByPeer | Self::Disconnected)
    }
}

/// Result type alias for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;
