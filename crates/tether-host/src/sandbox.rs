//! The Wasmtime execution engine.
//!
//! [`WasmtimeBackend`] implements [`GuestEngine`]: every instance gets its
//! own `Store` with resource limits, fuel and an epoch deadline, linked
//! against the `tether` host imports. [`WasmtimeGuest`] is the resulting
//! [`GuestInstance`].

use tether_core::backend::{ALLOC_EXPORT, MEMORY_EXPORT, check_bounds};
use tether_core::error::{CodecResult, LoadResult};
use tether_core::module::{format_signature, is_bridge_callable};
use tether_core::{
    DispatchError, ExportedFunction, GuestContext, GuestEngine, GuestFault, GuestInstance,
    GuestMemory, LoadError, ModuleLoader, ResourceLimits, SharedEngine, TrapInfo,
};
use tracing::{debug, info, warn};
use wasmtime::{
    Instance, Memory, Store, StoreLimitsBuilder, Trap, TypedFunc, Val, WasmBacktrace,
};

use crate::context::{GuestState, call_alloc, missing_alloc};
use crate::error::{HostError, HostResult};
use crate::linker::TetherLinker;

/// Turn an error raised while running guest code into a [`GuestFault`].
///
/// Errors raised by host imports come back wrapped in the trap: dispatch
/// errors are handed through unchanged so the outer caller sees the
/// original failure, and allocator faults keep their classification.
pub(crate) fn classify_error(err: wasmtime::Error) -> GuestFault {
    if let Some(dispatch) = err.downcast_ref::<DispatchError>() {
        return GuestFault::Host(Box::new(dispatch.clone()));
    }
    if let Some(HostError::Alloc(fault)) = err.downcast_ref::<HostError>() {
        return fault.clone();
    }

    let trap = err.downcast_ref::<Trap>().copied();
    match trap {
        Some(Trap::Interrupt) => return GuestFault::Interrupted("execution interrupted".into()),
        Some(Trap::OutOfFuel) => return GuestFault::Interrupted("fuel exhausted".into()),
        _ => {}
    }

    let mut info = TrapInfo::new(err.root_cause().to_string());
    if let Some(trap) = trap {
        info = info.with_code(format!("{trap:?}"));
    }
    if let Some(backtrace) = err.downcast_ref::<WasmBacktrace>() {
        info = info.with_backtrace(backtrace.to_string());
    }
    GuestFault::Trap(info)
}

/// The Wasmtime implementation of [`GuestEngine`].
pub struct WasmtimeBackend {
    engine: SharedEngine,
    loader: ModuleLoader,
    linker: TetherLinker,
    limits: ResourceLimits,
}

impl WasmtimeBackend {
    /// Create a backend over a shared engine.
    pub fn new(engine: SharedEngine, limits: ResourceLimits) -> HostResult<Self> {
        let linker = TetherLinker::with_host_imports(engine.inner())?;
        let loader = ModuleLoader::new(engine.clone());

        info!(
            max_memory = limits.max_memory_bytes,
            fuel_per_call = limits.fuel_per_call,
            "Created Wasmtime backend"
        );

        Ok(Self {
            engine,
            loader,
            linker,
            limits,
        })
    }

    /// The shared engine.
    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    /// The module loader used for every instance.
    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    /// Limits applied to every instance.
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// The linker instances are created with.
    pub fn linker(&self) -> &TetherLinker {
        &self.linker
    }
}

impl GuestEngine for WasmtimeBackend {
    fn instantiate(
        &self,
        bytes: &[u8],
        context: GuestContext,
    ) -> LoadResult<Box<dyn GuestInstance>> {
        let module = self.loader.load_bytes(bytes)?;
        let instance_id = context.instance_id;

        let limits = StoreLimitsBuilder::new()
            .memory_size(self.limits.max_memory_bytes)
            .table_elements(self.limits.max_table_elements as usize)
            .instances(1)
            .build();

        let mut store = Store::new(self.engine.inner(), GuestState::new(context, limits));
        store.limiter(|state| &mut state.limits);

        let fuel_per_call = self
            .engine
            .fuel_enabled()
            .then_some(self.limits.fuel_per_call);
        if let Some(fuel) = fuel_per_call {
            store
                .set_fuel(fuel)
                .map_err(|e| LoadError::InstantiationFailed(format!("{e:#}")))?;
        }

        let epoch_enabled = self.engine.epoch_enabled();
        if epoch_enabled {
            store.epoch_deadline_trap();
            store.set_epoch_deadline(1);
        }

        let instance = self
            .linker
            .instantiate(&mut store, module.inner())
            .map_err(|e| {
                warn!(instance_id = %instance_id, "Instantiation failed: {e:#}");
                LoadError::InstantiationFailed(format!("{e:#}"))
            })?;

        let memory = instance.get_memory(&mut store, MEMORY_EXPORT);
        let alloc = match instance.get_func(&mut store, ALLOC_EXPORT) {
            Some(func) => Some(func.typed::<i32, i32>(&store).map_err(|e| {
                LoadError::InstantiationFailed(format!(
                    "'{ALLOC_EXPORT}' must have type (i32) -> (i32): {e}"
                ))
            })?),
            None => None,
        };

        debug!(
            instance_id = %instance_id,
            has_memory = memory.is_some(),
            has_alloc = alloc.is_some(),
            "Instantiated guest"
        );

        Ok(Box::new(WasmtimeGuest {
            store,
            instance,
            memory,
            alloc,
            fuel_per_call,
            epoch_enabled,
        }))
    }

    fn interrupt(&self) {
        self.engine.increment_epoch();
    }
}

impl std::fmt::Debug for WasmtimeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmtimeBackend")
            .field("engine", &self.engine)
            .field("linker", &self.linker)
            .field("limits", &self.limits)
            .finish()
    }
}

/// One instance running in its own store.
pub struct WasmtimeGuest {
    store: Store<GuestState>,
    instance: Instance,
    memory: Option<Memory>,
    alloc: Option<TypedFunc<i32, i32>>,
    fuel_per_call: Option<u64>,
    epoch_enabled: bool,
}

impl WasmtimeGuest {
    /// Prepare the store for entering guest code: one epoch until the next
    /// interrupt, and a full fuel tank.
    fn arm(&mut self) -> Result<(), GuestFault> {
        if self.epoch_enabled {
            self.store.set_epoch_deadline(1);
        }
        if let Some(fuel) = self.fuel_per_call {
            self.store
                .set_fuel(fuel)
                .map_err(|e| GuestFault::Trap(TrapInfo::new(format!("cannot set fuel: {e}"))))?;
        }
        Ok(())
    }

    /// Fuel left from the last call, if fuel metering is on.
    pub fn remaining_fuel(&self) -> Option<u64> {
        self.fuel_per_call.and_then(|_| self.store.get_fuel().ok())
    }
}

impl GuestMemory for WasmtimeGuest {
    fn memory_size(&self) -> usize {
        self.memory.map_or(0, |memory| memory.data_size(&self.store))
    }

    fn read_memory(&self, offset: usize, len: usize) -> CodecResult<&[u8]> {
        let data: &[u8] = match &self.memory {
            Some(memory) => memory.data(&self.store),
            None => &[],
        };
        check_bounds(offset, len, data.len())?;
        Ok(&data[offset..offset + len])
    }

    fn write_memory(&mut self, offset: usize, bytes: &[u8]) -> CodecResult<()> {
        let data: &mut [u8] = match &self.memory {
            Some(memory) => memory.data_mut(&mut self.store),
            None => &mut [],
        };
        check_bounds(offset, bytes.len(), data.len())?;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn alloc(&mut self, size: u32) -> Result<u32, GuestFault> {
        self.arm()?;
        match &self.alloc {
            Some(alloc) => call_alloc(&mut self.store, alloc, size),
            None => Err(missing_alloc()),
        }
    }
}

impl GuestInstance for WasmtimeGuest {
    fn get_export(&mut self, name: &str) -> Option<ExportedFunction> {
        let func = self.instance.get_func(&mut self.store, name)?;
        let arity = func.ty(&self.store).params().len();
        Some(ExportedFunction {
            instance_id: self.store.data().context().instance_id,
            name: name.to_string(),
            arity,
        })
    }

    fn call_export(
        &mut self,
        export: &ExportedFunction,
        args: &[u64],
    ) -> Result<Option<u64>, GuestFault> {
        let func = self
            .instance
            .get_func(&mut self.store, &export.name)
            .ok_or_else(|| {
                GuestFault::Trap(TrapInfo::new(format!(
                    "'{}' is not a function export",
                    export.name
                )))
            })?;

        let ty = func.ty(&self.store);
        if !is_bridge_callable(&ty) {
            return Err(GuestFault::Trap(
                TrapInfo::new(format!(
                    "'{}' has signature {}; callable exports take i64 parameters and return at most one i64",
                    export.name,
                    format_signature(&ty)
                ))
                .with_code("signature"),
            ));
        }

        self.arm()?;
        let params: Vec<Val> = args.iter().map(|&arg| Val::I64(arg as i64)).collect();
        let mut results = vec![Val::I64(0); ty.results().len()];
        func.call(&mut self.store, &params, &mut results)
            .map_err(classify_error)?;

        Ok(results.first().and_then(Val::i64).map(|packed| packed as u64))
    }
}

impl std::fmt::Debug for WasmtimeGuest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmtimeGuest")
            .field("state", self.store.data())
            .field("memory_size", &self.memory_size())
            .field("has_alloc", &self.alloc.is_some())
            .finish()
    }
}
