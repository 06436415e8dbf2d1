//! WASM runtime implementation using wasmtime.
//!
//! Guests are linked against the custom WASI shim and the `env` bridge. The
//! guest memory is bound into both after instantiation.

use super::bridge::Bridge;
use super::config::WasmConfig;
use super::host::{register, HostApi};
use super::value::{WasmKind, WasmValue};
use super::wasi::WasiShim;
use crate::error::{Result, SandboxError};

use std::fmt;
use std::path::Path;
use std::time::Instant;

use wasmtime::*;

/// Host state for the WASM store.
pub struct HostState {
    wasi: WasiShim,
    bridge: Bridge,
    limits: StoreLimits,
}

impl HostState {
    fn wasi(&mut self) -> &mut WasiShim {
        &mut self.wasi
    }

    fn bridge(&mut self) -> &mut Bridge {
        &mut self.bridge
    }
}

/// A WebAssembly sandbox for running guest modules.
pub struct WasmSandbox {
    engine: Engine,
    config: WasmConfig,
}

/// A compiled WebAssembly module.
pub struct WasmModule {
    module: Module,
    name: String,
}

/// An instantiated WebAssembly module ready for execution.
pub struct WasmInstance {
    store: Store<HostState>,
    instance: Instance,
    entry_point: String,
}

/// Result of a WASM function call with timing information.
#[derive(Debug, Clone)]
pub struct WasmCallResult<T> {
    /// The return value
    pub value: T,
    /// Execution time in microseconds
    pub execution_time_us: u64,
    /// Fuel consumed (if fuel metering enabled)
    pub fuel_consumed: Option<u64>,
}

/// A guest import the host tables do not satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingImport {
    /// Import module namespace
    pub module: String,
    /// Import field name
    pub name: String,
    /// Signature the guest expects, e.g. `(i32, i64) -> (i32)`
    pub signature: String,
    /// Why it is unresolved
    pub reason: String,
}

impl fmt::Display for MissingImport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} {}: {}", self.module, self.name, self.signature, self.reason)
    }
}

impl From<MissingImport> for SandboxError {
    fn from(missing: MissingImport) -> Self {
        SandboxError::UnresolvedImport {
            module: missing.module,
            name: missing.name,
            reason: format!("{} {}", missing.signature, missing.reason),
        }
    }
}

struct HostImport {
    module: &'static str,
    name: &'static str,
    params: Vec<WasmKind>,
    results: Vec<WasmKind>,
}

fn host_table<A: HostApi>(out: &mut Vec<HostImport>) -> Result<()> {
    for function in A::functions()? {
        out.push(HostImport {
            module: A::MODULE,
            name: function.name(),
            params: function.params().to_vec(),
            results: function.results().to_vec(),
        });
    }
    Ok(())
}

fn signature_string(params: impl Iterator<Item = String>, results: impl Iterator<Item = String>) -> String {
    format!(
        "({}) -> ({})",
        params.collect::<Vec<_>>().join(", "),
        results.collect::<Vec<_>>().join(", ")
    )
}

fn type_name(ty: &ValType) -> String {
    match WasmKind::try_from(ty) {
        Ok(kind) => kind.name().to_string(),
        Err(_) => format!("{:?}", ty),
    }
}

fn kinds(types: impl Iterator<Item = ValType>) -> Option<Vec<WasmKind>> {
    types.map(|ty| WasmKind::try_from(&ty).ok()).collect()
}

/// Map a failed guest call to a sandbox error.
///
/// Host function errors travel through wasmtime as the trap payload and are
/// recovered here, so `proc_exit` and bridge failures keep their variant.
pub(crate) fn classify(error: Error) -> SandboxError {
    match error.downcast::<SandboxError>() {
        Ok(err) => err,
        Err(error) => match error.downcast_ref::<Trap>() {
            Some(trap) => SandboxError::Trap(trap.to_string()),
            None => SandboxError::Trap(format!("{:#}", error)),
        },
    }
}

impl WasmSandbox {
    /// Create a new WASM sandbox with the given configuration.
    pub fn new(config: WasmConfig) -> Result<Self> {
        let mut engine_config = Config::new();

        engine_config.cranelift_opt_level(match config.optimization_level {
            0 => OptLevel::None,
            1 => OptLevel::Speed,
            _ => OptLevel::SpeedAndSize,
        });

        engine_config.wasm_simd(config.enable_simd);

        if config.fuel_limit.is_some() {
            engine_config.consume_fuel(true);
        }

        if let Some(ref cache_path) = config.cache_path {
            if let Err(e) = engine_config.cache_config_load(cache_path) {
                tracing::warn!("Failed to load cache config: {}", e);
            }
        }

        let engine = Engine::new(&engine_config)
            .map_err(|e| SandboxError::WasmError(format!("engine creation failed: {}", e)))?;

        Ok(Self { engine, config })
    }

    /// Load a WASM module from a file. Text format is accepted too.
    pub fn load_module(&self, path: impl AsRef<Path>) -> Result<WasmModule> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        let module = Module::from_file(&self.engine, path)
            .map_err(|e| SandboxError::WasmError(format!("module load failed: {}", e)))?;

        Ok(WasmModule { module, name })
    }

    /// Load a WASM module from bytes.
    pub fn load_module_bytes(&self, name: &str, bytes: &[u8]) -> Result<WasmModule> {
        let module = Module::new(&self.engine, bytes)
            .map_err(|e| SandboxError::WasmError(format!("module creation failed: {}", e)))?;

        Ok(WasmModule {
            module,
            name: name.to_string(),
        })
    }

    /// Serialize a compiled module for another process.
    pub fn serialize_module(&self, module: &WasmModule) -> Result<Vec<u8>> {
        module
            .module
            .serialize()
            .map_err(|e| SandboxError::WasmError(format!("module serialization failed: {}", e)))
    }

    /// Rebuild a module from [`serialize_module`](Self::serialize_module) output.
    ///
    /// # Safety
    ///
    /// `bytes` must come from `serialize_module` on an engine with the same
    /// configuration. Wasmtime checks the header, not the machine code, so
    /// arbitrary bytes here mean arbitrary code execution.
    pub unsafe fn deserialize_module(&self, name: &str, bytes: &[u8]) -> Result<WasmModule> {
        let module = Module::deserialize(&self.engine, bytes)
            .map_err(|e| SandboxError::WasmError(format!("module deserialization failed: {}", e)))?;

        Ok(WasmModule {
            module,
            name: name.to_string(),
        })
    }

    /// Every import of `module` the WASI shim and bridge cannot satisfy.
    pub fn check_imports(&self, module: &WasmModule) -> Result<Vec<MissingImport>> {
        let mut table = Vec::new();
        host_table::<WasiShim>(&mut table)?;
        host_table::<Bridge>(&mut table)?;

        let mut missing = Vec::new();
        for import in module.module.imports() {
            let func = match import.ty() {
                ExternType::Func(func) => func,
                other => {
                    missing.push(MissingImport {
                        module: import.module().to_string(),
                        name: import.name().to_string(),
                        signature: format!("{:?}", other),
                        reason: "only function imports are provided".to_string(),
                    });
                    continue;
                }
            };

            let signature = signature_string(
                func.params().map(|ty| type_name(&ty)),
                func.results().map(|ty| type_name(&ty)),
            );
            let host = table
                .iter()
                .find(|h| h.module == import.module() && h.name == import.name());
            let reason = match host {
                None => "no host function with this name",
                Some(host) => {
                    let params = kinds(func.params());
                    let results = kinds(func.results());
                    if params.as_deref() == Some(&host.params[..]) && results.as_deref() == Some(&host.results[..]) {
                        continue;
                    }
                    "signature mismatch"
                }
            };
            missing.push(MissingImport {
                module: import.module().to_string(),
                name: import.name().to_string(),
                signature,
                reason: reason.to_string(),
            });
        }
        Ok(missing)
    }

    /// Instantiate a module against `wasi` and `bridge`.
    pub fn instantiate(&self, module: &WasmModule, wasi: WasiShim, bridge: Bridge) -> Result<WasmInstance> {
        let limits = StoreLimitsBuilder::new()
            .memory_size(self.config.max_memory)
            .build();
        let mut store = Store::new(&self.engine, HostState { wasi, bridge, limits });

        store.limiter(|state| &mut state.limits);

        if let Some(fuel) = self.config.fuel_limit {
            store
                .set_fuel(fuel)
                .map_err(|e| SandboxError::WasmError(format!("fuel setup failed: {}", e)))?;
        }

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        register(&mut linker, HostState::wasi)?;
        register(&mut linker, HostState::bridge)?;

        let instance = linker
            .instantiate(&mut store, &module.module)
            .map_err(|e| SandboxError::WasmError(format!("instantiation failed: {}", e)))?;

        match instance.get_memory(&mut store, "memory") {
            Some(memory) => {
                let state = store.data_mut();
                state.wasi.bind_memory(memory);
                state.bridge.bind_memory(memory);
            }
            None => tracing::warn!(module = %module.name, "guest exports no memory"),
        }

        Ok(WasmInstance {
            store,
            instance,
            entry_point: self.config.entry_point.clone(),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &WasmConfig {
        &self.config
    }
}

impl WasmModule {
    /// Get the module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get exported function names.
    pub fn exports(&self) -> impl Iterator<Item = &str> {
        self.module.exports().filter_map(|e| {
            if matches!(e.ty(), ExternType::Func(_)) {
                Some(e.name())
            } else {
                None
            }
        })
    }
}

impl WasmInstance {
    /// Call the entry point with zeroed arguments matching its signature.
    pub fn run(&mut self) -> Result<WasmCallResult<Vec<WasmValue>>> {
        let entry_point = self.entry_point.clone();
        let func = self
            .instance
            .get_func(&mut self.store, &entry_point)
            .ok_or_else(|| SandboxError::WasmError(format!("function '{}' not found", entry_point)))?;

        let ty = func.ty(&self.store);
        let params = kinds(ty.params()).ok_or_else(|| {
            SandboxError::WasmError(format!("entry point '{}' takes non-integer parameters", entry_point))
        })?;
        let args: Vec<Val> = params.into_iter().map(|k| WasmValue::zero(k).into()).collect();
        let mut results = vec![Val::I32(0); ty.results().len()];

        tracing::debug!(entry = %entry_point, args = args.len(), "calling guest");
        let start = Instant::now();
        let fuel_before = self.store.get_fuel().ok();

        func.call(&mut self.store, &args, &mut results).map_err(classify)?;

        let fuel_after = self.store.get_fuel().ok();
        let fuel_consumed = fuel_before.zip(fuel_after).map(|(b, a)| b - a);

        let value = results
            .iter()
            .map(WasmValue::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(WasmCallResult {
            value,
            execution_time_us: start.elapsed().as_micros() as u64,
            fuel_consumed,
        })
    }

    /// Replies the bridge has forwarded so far.
    pub fn replies(&self) -> usize {
        self.store.data().bridge.replies()
    }

    /// Tell the reply sink no more replies will follow.
    pub fn close_replies(&mut self) -> Result<()> {
        self.store.data_mut().bridge.close_replies()
    }

    /// Get remaining fuel (if fuel metering enabled).
    pub fn remaining_fuel(&self) -> Option<u64> {
        self.store.get_fuel().ok()
    }
}
