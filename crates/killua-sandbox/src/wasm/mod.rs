//! WebAssembly guest execution and host/guest marshalling.
//!
//! This module runs untrusted guest modules on wasmtime and gives them a
//! small, typed import surface.
//!
//! ## Layers
//!
//! - **Values** ([`WasmValue`], [`WasmKind`]): the raw `i32`/`i64` ABI slots
//! - **Bindings** ([`Binding`], [`BindingTree`]): how a Rust type maps onto a
//!   flat sequence of slots, built once per type and cached
//! - **Memory** ([`MemoryView`], [`WasmPtr`], [`WasmSlice`]): bounds-checked
//!   access to linear memory
//! - **Imports** ([`HostApi`], [`WasiShim`], [`Bridge`]): guest-callable
//!   functions, linked before instantiation and bound to memory after
//! - **Runtime** ([`WasmSandbox`]): engine, module cache format, entry call
//!
//! ## Usage
//!
//! ```rust,ignore
//! use killua_sandbox::wasm::{Bridge, WasiShim, WasmConfig, WasmSandbox};
//!
//! let sandbox = WasmSandbox::new(WasmConfig::default())?;
//! let module = sandbox.load_module("guest.wasm")?;
//!
//! let (tx, rx) = std::sync::mpsc::channel();
//! let bridge = Bridge::new("print('hi')", Box::new(tx));
//! let mut instance = sandbox.instantiate(&module, WasiShim::new(false), bridge)?;
//! instance.run()?;
//! ```

mod bind;
mod bridge;
mod config;
mod host;
mod memory;
mod pointer;
mod runtime;
mod value;
mod wasi;

pub use bind::{
    lift_value, lower_value, next_leaf, Binding, BindingTree, Primitive, WasmLift, WasmLower, WasmType,
    MAX_BINDING_DEPTH,
};
pub use bridge::{Bridge, ContextIds, ReplySink, BRIDGE_MODULE, MAX_SOURCE_LEN};
pub use config::WasmConfig;
pub use host::{register, GuestFunction, HostApi};
pub use memory::MemoryView;
pub use pointer::{WasmPtr, WasmSlice};
pub use runtime::{HostState, MissingImport, WasmCallResult, WasmInstance, WasmModule, WasmSandbox};
pub use value::{
    decode_leaves, encode_leaves, to_signed, to_signed64, to_unsigned, to_unsigned64, WasmKind, WasmValue,
};
pub use wasi::{WasiShim, ERRNO_BADF, ERRNO_NOSYS, ERRNO_SUCCESS, WASI_MODULE};
