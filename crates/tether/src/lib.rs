//! # Tether - a host bridge for WebAssembly guest modules
//!
//! Tether loads guest modules under stable integer handles and lets the
//! embedding application call their exports with dynamically-typed values.
//! Guests can hand the host callback references, which the host invokes
//! later or passes on to other guests.
//!
//! ## Features
//!
//! - **Dynamic values**: nil, booleans, integers, floats, strings, arrays,
//!   maps and callback references cross the boundary losslessly
//! - **Stable handles**: instance ids are never reused, so a stale handle
//!   can never reach a newer instance
//! - **Fault isolation**: guest traps fail the call, never the host
//! - **Cancellation**: interrupt running guests from another thread, or
//!   meter them with fuel
//!
//! ## Quick Start
//!
//! ```ignore
//! use tether::prelude::*;
//!
//! let runtime = Tether::builder()
//!     .with_memory_limit(16 * 1024 * 1024)
//!     .with_fuel_limit(10_000_000)
//!     .build()?;
//!
//! let id = runtime.load_file("plugin.wasm")?;
//! let sum = runtime.call(id, "add", &[DynamicValue::from(2), DynamicValue::from(3)])?;
//! assert_eq!(sum, DynamicValue::Integer(5));
//! runtime.unload(id)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Your Application                     │
//! ├─────────────────────────────────────────────────────────┤
//! │                     tether (facade)                     │
//! │                   ┌──────────────────┐                  │
//! │                   │  TetherRuntime   │                  │
//! │                   └────────┬─────────┘                  │
//! │                            │                            │
//! │  ┌──────────────┬─────────┴────────┬────────────────┐   │
//! │  │ tether-core  │   tether-host    │ tether-observe │   │
//! │  │ (codec,      │   (wasmtime      │ (events)       │   │
//! │  │  dispatcher) │    backend)      │                │   │
//! │  └──────────────┴──────────────────┴────────────────┘   │
//! ├─────────────────────────────────────────────────────────┤
//! │                       Wasmtime                          │
//! └─────────────────────────────────────────────────────────┘
//! ```

use std::path::Path;
use std::sync::{Arc, Weak};

use tether_core::error::{DispatchResult, InvokeResult, LoadResult};
use tether_core::{
    BridgeConfig, CallbackRef, Dispatcher, DynamicValue, EngineConfig, EngineError,
    InstanceError, InstanceId, IntoShared, LoadError, ModuleLoader, ResourceLimits, SharedEngine,
    TetherEngine, ValidatedModule,
};
use tether_host::{HostError, WasmtimeBackend};
use tether_observe::{EventDispatcher, EventSubscriber, LoggingSubscriber};
use tracing::info;

// Re-export from sub-crates
pub use tether_core;
pub use tether_host;
pub use tether_observe;

/// Main entry point for Tether.
pub struct Tether;

impl Tether {
    /// Create a new runtime builder.
    pub fn builder() -> TetherBuilder {
        TetherBuilder::new()
    }

    /// Create a runtime with default configuration.
    pub fn with_defaults() -> Result<TetherRuntime, BuildError> {
        TetherBuilder::new().build()
    }
}

/// Builder for configuring the runtime.
pub struct TetherBuilder {
    config: BridgeConfig,
    event_subscribers: Vec<Arc<dyn EventSubscriber>>,
}

impl TetherBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: BridgeConfig::default(),
            event_subscribers: Vec::new(),
        }
    }

    /// Replace the whole configuration, e.g. one loaded from a file.
    pub fn with_config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    // Engine configuration

    /// Set the engine configuration.
    pub fn with_engine_config(mut self, engine: EngineConfig) -> Self {
        self.config.engine = engine;
        self
    }

    /// Enable or disable interruption through [`InterruptHandle`].
    pub fn with_interrupts(mut self, enabled: bool) -> Self {
        self.config.engine.epoch_enabled = enabled;
        self
    }

    /// Enable or disable debug info.
    pub fn with_debug_info(mut self, enabled: bool) -> Self {
        self.config.engine.debug_info = enabled;
        self
    }

    // Resource limits

    /// Set the maximum memory per instance in bytes.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.config.limits.max_memory_bytes = bytes;
        self
    }

    /// Meter every call with the given amount of fuel.
    pub fn with_fuel_limit(mut self, fuel: u64) -> Self {
        self.config.engine.fuel_enabled = true;
        self.config.limits.fuel_per_call = fuel;
        self
    }

    /// Set custom resource limits.
    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.config.limits = limits;
        self
    }

    /// Set the nesting limit for values crossing the boundary.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.config.max_depth = depth;
        self
    }

    // Observability

    /// Add an event subscriber.
    pub fn with_event_subscriber(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.event_subscribers.push(subscriber);
        self
    }

    /// Forward every bridge event to `tracing`.
    pub fn with_event_logging(self) -> Self {
        self.with_event_subscriber(Arc::new(LoggingSubscriber::new()))
    }

    /// Build the runtime.
    pub fn build(self) -> Result<TetherRuntime, BuildError> {
        let engine = TetherEngine::new(self.config.engine.clone())?.into_shared();
        let backend = WasmtimeBackend::new(Arc::clone(&engine), self.config.limits.clone())?;
        let loader = ModuleLoader::new(Arc::clone(&engine));

        let events = EventDispatcher::new();
        for subscriber in self.event_subscribers {
            events.subscribe(subscriber);
        }

        let dispatcher = Dispatcher::new(Arc::new(backend), self.config.max_depth, Arc::new(events));

        info!(
            fuel = self.config.engine.fuel_enabled,
            interrupts = self.config.engine.epoch_enabled,
            max_depth = self.config.max_depth,
            "Built Tether runtime"
        );

        Ok(TetherRuntime {
            engine,
            loader,
            dispatcher,
            config: self.config,
        })
    }
}

impl Default for TetherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A configured runtime: owns the bridge and every instance loaded into it.
///
/// Dropping the runtime unloads all instances and invalidates their
/// callback references.
pub struct TetherRuntime {
    engine: SharedEngine,
    loader: ModuleLoader,
    dispatcher: Arc<Dispatcher>,
    config: BridgeConfig,
}

impl TetherRuntime {
    /// The configuration the runtime was built with.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Get a reference to the engine.
    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    /// The dispatcher all calls go through.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Get the event dispatcher.
    pub fn event_dispatcher(&self) -> &Arc<EventDispatcher> {
        self.dispatcher.events()
    }

    /// Compile module bytes without instantiating them, for inspection.
    pub fn compile(&self, bytes: &[u8]) -> LoadResult<ValidatedModule> {
        self.loader.load_bytes(bytes)
    }

    /// Load a module from bytes.
    pub fn load(&self, bytes: &[u8]) -> LoadResult<InstanceId> {
        self.dispatcher.load(bytes)
    }

    /// Load a module from a file.
    pub fn load_file(&self, path: impl AsRef<Path>) -> LoadResult<InstanceId> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            LoadError::InvalidModule(format!("cannot read {}: {e}", path.display()))
        })?;
        self.load(&bytes)
    }

    /// Load a module from WAT text format.
    pub fn load_wat(&self, wat: &str) -> LoadResult<InstanceId> {
        let wasm = wat::parse_str(wat).map_err(|e| LoadError::InvalidModule(e.to_string()))?;
        self.load(&wasm)
    }

    /// Call an export by exact name.
    pub fn call(
        &self,
        id: InstanceId,
        function: &str,
        args: &[DynamicValue],
    ) -> DispatchResult<DynamicValue> {
        self.dispatcher.call(id, function, args)
    }

    /// Call the instance's `run` export with no arguments.
    pub fn run(&self, id: InstanceId) -> DispatchResult<DynamicValue> {
        self.dispatcher.run(id)
    }

    /// Unload an instance.
    pub fn unload(&self, id: InstanceId) -> Result<(), InstanceError> {
        self.dispatcher.unload(id)
    }

    /// Register a guest function index as a callback.
    pub fn register_callback(
        &self,
        id: InstanceId,
        guest_index: u32,
    ) -> Result<CallbackRef, InstanceError> {
        self.dispatcher.register_callback(id, guest_index)
    }

    /// Invoke a callback, discarding its result.
    pub fn invoke(
        &self,
        callback: CallbackRef,
        name_hint: Option<&str>,
        args: Vec<DynamicValue>,
    ) -> InvokeResult<()> {
        self.dispatcher.invoke(callback, name_hint, args)
    }

    /// Invoke a callback and return its result.
    pub fn invoke_returning(
        &self,
        callback: CallbackRef,
        name_hint: Option<&str>,
        args: Vec<DynamicValue>,
    ) -> InvokeResult<DynamicValue> {
        self.dispatcher.invoke_returning(callback, name_hint, args)
    }

    /// Release a callback reference.
    pub fn release_callback(&self, callback: CallbackRef) -> InvokeResult<()> {
        self.dispatcher.release_callback(callback)
    }

    /// Interrupt whatever guest code is running.
    pub fn interrupt(&self) {
        self.dispatcher.interrupt();
    }

    /// A handle that can interrupt guests from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            dispatcher: Arc::downgrade(&self.dispatcher),
        }
    }

    /// Ids of all live instances, ascending.
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.dispatcher.instance_ids()
    }

    /// Check whether an id names a live instance.
    pub fn is_loaded(&self, id: InstanceId) -> bool {
        self.dispatcher.is_loaded(id)
    }

    /// Check whether a live instance has been poisoned.
    pub fn is_poisoned(&self, id: InstanceId) -> Result<bool, InstanceError> {
        self.dispatcher.is_poisoned(id)
    }
}

impl std::fmt::Debug for TetherRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TetherRuntime")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

/// Interrupts guest execution from any thread.
///
/// The handle does not keep the runtime alive.
#[derive(Clone)]
pub struct InterruptHandle {
    dispatcher: Weak<Dispatcher>,
}

impl InterruptHandle {
    /// Interrupt the running guest call, if any. Returns `false` when the
    /// runtime has been dropped.
    pub fn interrupt(&self) -> bool {
        match self.dispatcher.upgrade() {
            Some(dispatcher) => {
                dispatcher.interrupt();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptHandle")
            .field("alive", &(self.dispatcher.strong_count() > 0))
            .finish()
    }
}

/// Errors from building the runtime.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Engine error.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Host setup error.
    #[error("Host error: {0}")]
    Host(#[from] HostError),
}

/// Prelude module for convenient imports.
pub mod prelude {
    // Main types
    pub use crate::{BuildError, InterruptHandle, Tether, TetherBuilder, TetherRuntime};

    // Core types
    pub use tether_core::{
        BridgeConfig, CallbackRef, DispatchError, DynamicValue, EngineConfig, ErrorKind,
        InstanceError, InstanceId, InvokeError, LoadError, ResourceLimits, TetherError,
    };

    // Observability types
    pub use tether_observe::{
        BridgeEvent, CollectingSubscriber, EventDispatcher, EventSubscriber, LoggingSubscriber,
    };

    // Common std types
    pub use std::sync::Arc;
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use tether_core::{DispatchError, ErrorKind, InvokeError};
    use tether_observe::CollectingSubscriber;

    use super::*;

    const CALC: &str = r#"
        (module
            (import "tether" "register_callback" (func $register (param i32) (result i64)))
            (memory (export "memory") 1)
            (global $heap (mut i32) (i32.const 1024))
            (global $cb (mut i64) (i64.const 0))
            (global $last_args (mut i64) (i64.const 0))
            (func $alloc (export "alloc") (param $size i32) (result i32)
                (local $ptr i32)
                (local.set $ptr (global.get $heap))
                (global.set $heap (i32.add (global.get $heap) (local.get $size)))
                (local.get $ptr))
            (func $int_at (param $p i64) (result i64)
                (i64.load offset=1 (i32.wrap_i64 (i64.shr_u (local.get $p) (i64.const 32)))))
            (func $ret_int (param $v i64) (result i64)
                (local $ptr i32)
                (local.set $ptr (call $alloc (i32.const 9)))
                (i32.store8 (local.get $ptr) (i32.const 3))
                (i64.store offset=1 (local.get $ptr) (local.get $v))
                (i64.or
                    (i64.shl (i64.extend_i32_u (local.get $ptr)) (i64.const 32))
                    (i64.const 9)))
            (func $init (global.set $cb (call $register (i32.const 3))))
            (start $init)
            (func (export "add") (param $a i64) (param $b i64) (result i64)
                (call $ret_int (i64.add (call $int_at (local.get $a)) (call $int_at (local.get $b)))))
            (func (export "divide") (param $a i64) (param $b i64) (result i64)
                (call $ret_int (i64.div_s (call $int_at (local.get $a)) (call $int_at (local.get $b)))))
            (func (export "run") (result i64) (call $ret_int (i64.const 42)))
            (func (export "spin") (loop $l (br $l)))
            (func (export "get_callback") (result i64)
                (local $ptr i32)
                (local.set $ptr (call $alloc (i32.const 9)))
                (i32.store8 (local.get $ptr) (i32.const 8))
                (i32.store offset=1 (local.get $ptr)
                    (i32.wrap_i64 (i64.shr_u (global.get $cb) (i64.const 32))))
                (i32.store offset=5 (local.get $ptr) (i32.wrap_i64 (global.get $cb)))
                (i64.or
                    (i64.shl (i64.extend_i32_u (local.get $ptr)) (i64.const 32))
                    (i64.const 9)))
            (func (export "tether_call_callback") (param $index i64) (param $args i64)
                (global.set $last_args (local.get $args)))
            (func (export "last_args") (result i64) (global.get $last_args))
        )
    "#;

    fn int(v: i64) -> DynamicValue {
        DynamicValue::Integer(v)
    }

    #[test]
    fn test_tether_builder() {
        let runtime = Tether::builder()
            .with_memory_limit(32 * 1024 * 1024)
            .with_fuel_limit(100_000)
            .with_max_depth(16)
            .build()
            .unwrap();

        assert_eq!(runtime.config().limits.max_memory_bytes, 32 * 1024 * 1024);
        assert_eq!(runtime.config().limits.fuel_per_call, 100_000);
        assert!(runtime.engine().fuel_enabled());
        assert_eq!(runtime.dispatcher().max_depth(), 16);
    }

    #[test]
    fn test_load_call_unload() {
        let runtime = Tether::with_defaults().unwrap();

        let id = runtime.load_wat(CALC).unwrap();
        assert_eq!(id.get(), 0);
        assert_eq!(runtime.call(id, "add", &[int(2), int(3)]).unwrap(), int(5));

        runtime.unload(id).unwrap();
        let err = runtime.call(id, "add", &[int(2), int(3)]).unwrap_err();
        assert!(matches!(err, DispatchError::Instance(InstanceError::NotFound(gone)) if gone == id));
        assert_eq!(err.kind(), ErrorKind::InstanceNotFound);

        assert!(matches!(runtime.unload(id), Err(InstanceError::NotFound(_))));
    }

    #[test]
    fn test_trap_isolation() {
        let runtime = Tether::with_defaults().unwrap();
        runtime.load_wat(CALC).unwrap();
        let id = runtime.load_wat(CALC).unwrap();
        assert_eq!(id.get(), 1);

        let err = runtime.call(id, "divide", &[int(1), int(0)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Trap);
        assert!(err.to_string().contains("divide by zero"), "{err}");

        // A trap fails only the one call.
        assert_eq!(runtime.call(id, "add", &[int(1), int(1)]).unwrap(), int(2));
        assert!(!runtime.is_poisoned(id).unwrap());
    }

    #[test]
    fn test_ids_are_monotonic() {
        let runtime = Tether::with_defaults().unwrap();

        let a = runtime.load_wat(CALC).unwrap();
        runtime.unload(a).unwrap();
        let b = runtime.load_wat(CALC).unwrap();
        let c = runtime.load_wat(CALC).unwrap();

        assert!(a < b && b < c);
        assert_eq!(runtime.instance_ids(), vec![b, c]);
        assert!(!runtime.is_loaded(a));
    }

    #[test]
    fn test_callback_round_trip() {
        let runtime = Tether::with_defaults().unwrap();
        let id = runtime.load_wat(CALC).unwrap();

        let callback = runtime
            .call(id, "get_callback", &[])
            .unwrap()
            .as_callback()
            .unwrap();
        runtime
            .invoke(callback, Some("event"), vec![DynamicValue::from("hello")])
            .unwrap();

        let seen = runtime.call(id, "last_args", &[]).unwrap();
        assert_eq!(
            seen,
            DynamicValue::Array(vec![DynamicValue::from("event"), DynamicValue::from("hello")])
        );
    }

    #[test]
    fn test_callback_invalid_after_unload() {
        let runtime = Tether::with_defaults().unwrap();
        let id = runtime.load_wat(CALC).unwrap();
        let callback = runtime
            .call(id, "get_callback", &[])
            .unwrap()
            .as_callback()
            .unwrap();

        runtime.unload(id).unwrap();

        let err = runtime.invoke(callback, None, vec![]).unwrap_err();
        assert!(matches!(err, InvokeError::CallbackInvalid(r) if r == callback));
    }

    #[test]
    fn test_run_entry_point() {
        let runtime = Tether::with_defaults().unwrap();
        let id = runtime.load_wat(CALC).unwrap();

        assert_eq!(runtime.run(id).unwrap(), int(42));
    }

    #[test]
    fn test_interrupt_handle() {
        let runtime = Tether::with_defaults().unwrap();
        let id = runtime.load_wat(CALC).unwrap();
        let handle = runtime.interrupt_handle();

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let interrupter = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(std::sync::atomic::Ordering::SeqCst) {
                    handle.interrupt();
                    thread::sleep(Duration::from_millis(5));
                }
            })
        };

        let err = runtime.call(id, "spin", &[]).unwrap_err();
        stop.store(true, std::sync::atomic::Ordering::SeqCst);
        interrupter.join().unwrap();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(runtime.call(id, "add", &[int(1), int(2)]).unwrap(), int(3));
    }

    #[test]
    fn test_interrupt_handle_outlives_runtime() {
        let runtime = Tether::with_defaults().unwrap();
        let handle = runtime.interrupt_handle();

        assert!(handle.interrupt());
        drop(runtime);
        assert!(!handle.interrupt());
    }

    #[test]
    fn test_events_reach_subscribers() {
        let collector = Arc::new(CollectingSubscriber::new(64));
        let runtime = Tether::builder()
            .with_event_subscriber(Arc::clone(&collector) as Arc<dyn EventSubscriber>)
            .with_event_logging()
            .build()
            .unwrap();

        let id = runtime.load_wat(CALC).unwrap();
        runtime.call(id, "add", &[int(1), int(1)]).unwrap();
        runtime.unload(id).unwrap();

        assert_eq!(
            collector.event_types(),
            vec!["instance_loaded", "call_started", "call_completed", "instance_unloaded"]
        );
    }

    #[test]
    fn test_load_errors() {
        let runtime = Tether::with_defaults().unwrap();

        let err = runtime.load_wat("(module (func").unwrap_err();
        assert!(matches!(err, LoadError::InvalidModule(_)));

        let err = runtime.load_file("/nonexistent/plugin.wasm").unwrap_err();
        assert!(matches!(err, LoadError::InvalidModule(_)));

        assert!(runtime.instance_ids().is_empty());
    }

    #[test]
    fn test_compile_for_inspection() {
        let runtime = Tether::with_defaults().unwrap();
        let wasm = wat::parse_str(CALC).unwrap();

        let module = runtime.compile(&wasm).unwrap();
        assert!(module.has_export("add"));
        assert!(module.requires_import("tether", "register_callback"));
        assert!(runtime.instance_ids().is_empty());
    }

    #[test]
    fn test_prelude_imports() {
        use crate::prelude::*;

        let _runtime = Tether::builder().build().unwrap();
        let _value = DynamicValue::Nil;
    }
}
