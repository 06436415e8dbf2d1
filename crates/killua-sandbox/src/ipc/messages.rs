//! Values exchanged between the parent and a worker.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::wasm::{ContextIds, WasmConfig};

/// Everything a worker needs to run one guest invocation.
///
/// The parent sends exactly one job, then closes its side of the pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job<'a> {
    /// Engine settings the module was compiled with
    pub config: WasmConfig,
    /// Output of `WasmSandbox::serialize_module`
    pub module: Cow<'a, [u8]>,
    /// The snippet the guest reads with `context_read_code`
    pub source: Cow<'a, str>,
    /// Ids the guest reads with `context_environment`
    pub context: ContextIds,
}

/// Worker to parent traffic. Anything that does not decode as one of these
/// is a protocol violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerMessage {
    /// One `message_reply` from the guest
    Reply {
        /// Reply text
        content: String,
    },
}
