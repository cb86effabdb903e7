//! Linker wrapper that carries the `tether` host-import module.
//!
//! [`TetherLinker`] wraps Wasmtime's `Linker` and records every host
//! function registered through it, rejecting duplicates. The bridge imports
//! themselves are installed by [`TetherLinker::with_host_imports`]:
//!
//! | import | signature | effect |
//! |--------|-----------|--------|
//! | `register_callback` | `(index: i32) -> i64` | append a slot, return the packed reference |
//! | `release_callback`  | `(slot: i32)` | tombstone a slot of the calling instance |
//! | `invoke_callback`   | `(instance_id: i32, slot: i32, args: i64) -> i64` | call a callback, `-1` if the reference is invalid |
//! | `log`               | `(level: i32, ptr: i32, len: i32)` | forward guest text to `tracing` |

use tether_core::backend::HOST_MODULE;
use tether_core::{CallbackRef, DynamicValue, InstanceId, InvokeError};
use tracing::{debug, error, info, trace, warn};
use wasmtime::{Caller, Engine, Instance, Linker, Module, Store};

use crate::context::{GuestState, HostContext};
use crate::error::{HostError, HostResult};

/// Returned by `invoke_callback` when the reference no longer resolves.
pub const INVALID_CALLBACK: i64 = -1;

/// Information about a registered host function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredFunction {
    /// The import module name.
    pub module: String,
    /// The function name.
    pub name: String,
}

/// A wrapper around Wasmtime's `Linker` for guest stores.
pub struct TetherLinker {
    inner: Linker<GuestState>,
    registered: Vec<RegisteredFunction>,
}

impl TetherLinker {
    /// Create an empty linker for the given engine.
    pub fn new(engine: &Engine) -> Self {
        Self {
            inner: Linker::new(engine),
            registered: Vec::new(),
        }
    }

    /// Create a linker with the `tether` host imports installed.
    pub fn with_host_imports(engine: &Engine) -> HostResult<Self> {
        let mut linker = Self::new(engine);
        linker.func_wrap(HOST_MODULE, "register_callback", register_callback)?;
        linker.func_wrap(HOST_MODULE, "release_callback", release_callback)?;
        linker.func_wrap(HOST_MODULE, "invoke_callback", invoke_callback)?;
        linker.func_wrap(HOST_MODULE, "log", guest_log)?;
        info!(functions = linker.registered.len(), "Built host linker");
        Ok(linker)
    }

    /// Get a reference to the underlying Wasmtime linker.
    pub fn inner(&self) -> &Linker<GuestState> {
        &self.inner
    }

    /// Get the list of registered functions.
    pub fn registered_functions(&self) -> &[RegisteredFunction] {
        &self.registered
    }

    /// Check if a function is already registered.
    pub fn is_registered(&self, module: &str, name: &str) -> bool {
        self.registered
            .iter()
            .any(|f| f.module == module && f.name == name)
    }

    /// Register a host function.
    pub fn func_wrap<Params, Results>(
        &mut self,
        module: &str,
        name: &str,
        func: impl wasmtime::IntoFunc<GuestState, Params, Results>,
    ) -> HostResult<&mut Self> {
        if self.is_registered(module, name) {
            return Err(HostError::AlreadyRegistered {
                module: module.to_string(),
                name: name.to_string(),
            });
        }

        self.inner
            .func_wrap(module, name, func)
            .map_err(|e| HostError::RegistrationFailed {
                module: module.to_string(),
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        self.registered.push(RegisteredFunction {
            module: module.to_string(),
            name: name.to_string(),
        });

        debug!(module, name, "Registered host function");
        Ok(self)
    }

    /// Instantiate a compiled module into a store.
    pub fn instantiate(
        &self,
        store: &mut Store<GuestState>,
        module: &Module,
    ) -> wasmtime::Result<Instance> {
        self.inner.instantiate(store, module)
    }
}

impl std::fmt::Debug for TetherLinker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TetherLinker")
            .field("registered_functions", &self.registered.len())
            .finish()
    }
}

fn register_callback(caller: Caller<'_, GuestState>, index: i32) -> wasmtime::Result<i64> {
    let context = caller.data().context();
    let index = u32::try_from(index)
        .map_err(|_| HostError::InvalidArgument(format!("negative function index {index}")))?;
    let callback = context
        .callbacks
        .register(index)
        .ok_or(HostError::CallbackTableClosed(context.instance_id.get()))?;
    debug!(callback = %callback, guest_index = index, "Guest registered callback");
    Ok(callback.pack() as i64)
}

fn release_callback(caller: Caller<'_, GuestState>, slot: i32) -> wasmtime::Result<()> {
    let context = caller.data().context();
    let Ok(slot) = u32::try_from(slot) else {
        return Err(HostError::InvalidArgument(format!("negative callback slot {slot}")).into());
    };
    match context.callbacks.release(slot) {
        Some(guest_index) => {
            debug!(instance_id = %context.instance_id, slot, guest_index, "Guest released callback")
        }
        None => trace!(instance_id = %context.instance_id, slot, "Release of dead slot ignored"),
    }
    Ok(())
}

fn invoke_callback(
    caller: Caller<'_, GuestState>,
    instance_id: i32,
    slot: i32,
    args: i64,
) -> wasmtime::Result<i64> {
    let mut ctx = HostContext::new(caller)?;

    let callback = match (
        u32::try_from(instance_id).ok().and_then(InstanceId::from_raw),
        u32::try_from(slot),
    ) {
        (Some(id), Ok(slot)) => CallbackRef::new(id, slot),
        _ => return Ok(INVALID_CALLBACK),
    };

    let args = match ctx.decode_value(args as u64)? {
        DynamicValue::Array(items) => items,
        other => {
            return Err(HostError::InvalidArgument(format!(
                "callback arguments must be an array, got {}",
                other.type_name()
            ))
            .into());
        }
    };

    let bridge = ctx.guest().bridge.upgrade().ok_or(HostError::BridgeGone)?;
    debug!(
        caller = %ctx.guest().instance_id,
        callback = %callback,
        "Guest invoking callback"
    );

    match bridge.invoke_callback(callback, args) {
        Ok(value) => Ok(ctx.encode_value(&value)?.pack() as i64),
        Err(InvokeError::CallbackInvalid(_)) => Ok(INVALID_CALLBACK),
        Err(InvokeError::Dispatch(err)) => Err(wasmtime::Error::new(err)),
    }
}

fn guest_log(caller: Caller<'_, GuestState>, level: i32, ptr: i32, len: i32) -> wasmtime::Result<()> {
    let ctx = HostContext::new(caller)?;
    let (Ok(ptr), Ok(len)) = (usize::try_from(ptr), usize::try_from(len)) else {
        return Err(HostError::InvalidArgument(format!("bad log region {ptr}+{len}")).into());
    };
    let message = ctx.read_string_lossy(ptr, len)?;
    let instance_id = ctx.guest().instance_id.get();

    match level {
        0 => trace!(target: "tether::guest", instance_id, "{message}"),
        1 => debug!(target: "tether::guest", instance_id, "{message}"),
        2 => info!(target: "tether::guest", instance_id, "{message}"),
        3 => warn!(target: "tether::guest", instance_id, "{message}"),
        _ => error!(target: "tether::guest", instance_id, "{message}"),
    }
    Ok(())
}
