//! Guest-callable host functions and their registration with wasmtime.
//!
//! A [`GuestFunction`] pairs a native handler with the binding trees derived
//! for its parameters and results. Groups of functions live on a
//! [`HostApi`] object, which is registered into a [`Linker`] through a
//! projection from the store state, the same way wasmtime's own WASI crate
//! registers its context.
//!
//! Instantiation is two-phase: functions are linked before the guest memory
//! exists, and [`HostApi::bind_memory`] hands each API the memory once the
//! instance is up. Calls that need memory before that point fail.

use std::sync::Arc;

use wasmtime::{Caller, FuncType, Linker, Memory, Val};

use super::bind::{lower_value, BindingTree, WasmLift, WasmLower};
use super::memory::MemoryView;
use super::value::{mismatch, WasmKind, WasmValue};
use crate::error::{Result, SandboxError};

type Handler<A> = dyn Fn(&mut A, &mut MemoryView<'_>, &[WasmValue]) -> Result<Vec<WasmValue>> + Send + Sync;

/// A host function the guest can import.
pub struct GuestFunction<A> {
    name: &'static str,
    params: Vec<WasmKind>,
    results: Vec<WasmKind>,
    uses_memory: bool,
    handler: Arc<Handler<A>>,
}

impl<A: 'static> GuestFunction<A> {
    /// Wrap a typed handler.
    ///
    /// Parameter and result binding trees are built here, so a malformed
    /// composite fails at registration rather than on the first call.
    pub fn wrap<P, R, F>(name: &'static str, f: F) -> Result<Self>
    where
        P: WasmLift + 'static,
        R: WasmLower + 'static,
        F: Fn(&mut A, &mut MemoryView<'_>, P) -> Result<R> + Send + Sync + 'static,
    {
        let params = BindingTree::of::<P>()?;
        let results = BindingTree::of::<R>()?;
        let arity = params.leaf_count();

        let handler = move |api: &mut A, memory: &mut MemoryView<'_>, values: &[WasmValue]| {
            if values.len() != arity {
                return Err(SandboxError::ArgumentCount {
                    expected: arity,
                    found: values.len(),
                });
            }
            let args = P::lift(memory, &mut values.iter().copied())?;
            let returned = f(api, memory, args)?;
            lower_value(&returned)
        };

        Ok(Self {
            name,
            params: params.signature().to_vec(),
            results: results.signature().to_vec(),
            uses_memory: true,
            handler: Arc::new(handler),
        })
    }

    /// Wrap an untyped handler with an explicit ABI signature.
    ///
    /// Raw functions never see guest memory.
    pub fn raw<F>(name: &'static str, params: Vec<WasmKind>, results: Vec<WasmKind>, f: F) -> Self
    where
        F: Fn(&mut A, &[WasmValue]) -> Result<Vec<WasmValue>> + Send + Sync + 'static,
    {
        let handler = move |api: &mut A, _: &mut MemoryView<'_>, values: &[WasmValue]| f(api, values);
        Self {
            name,
            params,
            results,
            uses_memory: false,
            handler: Arc::new(handler),
        }
    }

    /// Import name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Flat parameter signature.
    pub fn params(&self) -> &[WasmKind] {
        &self.params
    }

    /// Flat result signature.
    pub fn results(&self) -> &[WasmKind] {
        &self.results
    }

    /// Invoke the handler directly, outside of any wasm instance.
    pub fn call(&self, api: &mut A, memory: &mut MemoryView<'_>, values: &[WasmValue]) -> Result<Vec<WasmValue>> {
        let out = (self.handler)(api, memory, values)?;
        check_kinds(&self.results, &out)?;
        Ok(out)
    }
}

fn check_kinds(expected: &[WasmKind], values: &[WasmValue]) -> Result<()> {
    if expected.len() != values.len() {
        return Err(SandboxError::ArgumentCount {
            expected: expected.len(),
            found: values.len(),
        });
    }
    for (kind, value) in expected.iter().zip(values) {
        if *kind != value.kind() {
            return Err(mismatch(*kind, value.kind()));
        }
    }
    Ok(())
}

/// A set of guest-callable functions sharing one import namespace.
pub trait HostApi: Sized + Send + 'static {
    /// Import module name the guest uses, e.g. `wasi_snapshot_preview1`.
    const MODULE: &'static str;

    /// Every function this API exports to the guest.
    fn functions() -> Result<Vec<GuestFunction<Self>>>;

    /// The bound guest memory, if instantiation has finished.
    fn memory(&self) -> Option<Memory>;

    /// Hand the API the guest's memory after instantiation.
    fn bind_memory(&mut self, memory: Memory);
}

/// Register every function of `A` into `linker`.
///
/// `get` projects the API object out of the store state.
pub fn register<S, A>(linker: &mut Linker<S>, get: fn(&mut S) -> &mut A) -> Result<()>
where
    S: 'static,
    A: HostApi,
{
    for function in A::functions()? {
        let ty = FuncType::new(
            linker.engine(),
            function.params.iter().copied().map(Into::into),
            function.results.iter().copied().map(Into::into),
        );
        let name = function.name;
        let params = function.params.clone();
        let results = function.results.clone();
        let uses_memory = function.uses_memory;
        let handler = Arc::clone(&function.handler);

        linker
            .func_new(
                A::MODULE,
                name,
                ty,
                move |mut caller: Caller<'_, S>, args: &[Val], out: &mut [Val]| {
                    let values = args
                        .iter()
                        .map(WasmValue::try_from)
                        .collect::<Result<Vec<_>>>()?;
                    check_kinds(&params, &values)?;
                    tracing::trace!(module = A::MODULE, function = name, ?values, "host call");

                    let returned = if uses_memory {
                        let memory = get(caller.data_mut())
                            .memory()
                            .ok_or(SandboxError::MemoryUnbound(name))?;
                        let (data, state) = memory.data_and_store_mut(&mut caller);
                        let mut view = MemoryView::new(data);
                        handler(get(state), &mut view, &values)?
                    } else {
                        let mut empty = [0u8; 0];
                        let mut view = MemoryView::new(&mut empty);
                        handler(get(caller.data_mut()), &mut view, &values)?
                    };

                    check_kinds(&results, &returned)?;
                    for (slot, value) in out.iter_mut().zip(returned) {
                        *slot = value.into();
                    }
                    Ok(())
                },
            )
            .map_err(|e| {
                SandboxError::ConfigError(format!("failed to register {}.{}: {}", A::MODULE, name, e))
            })?;
    }
    Ok(())
}
