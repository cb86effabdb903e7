//! Tether Core - guest-module host bridge
//!
//! This crate holds the parts of Tether that do not depend on how guest code
//! is executed:
//!
//! - [`DynamicValue`]: the host-side value model
//! - [`codec`]: conversion between values and the guest memory encoding
//! - [`InstanceRegistry`]: live instances under monotonic [`InstanceId`]s
//! - [`CallbackTable`]: guest callbacks behind weak [`CallbackRef`]s
//! - [`Dispatcher`]: the single entry point for calls in both directions
//!
//! Execution is reached through the [`GuestEngine`] capability. The Wasmtime
//! implementation lives in `tether-host`; [`TetherEngine`] and
//! [`ModuleLoader`] are the shared pieces it is built from.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Application                │
//! ├─────────────────────────────────────────┤
//! │            tether (facade)              │
//! ├─────────────────────────────────────────┤
//! │  tether-core  │ tether-host │ observe   │
//! ├─────────────────────────────────────────┤
//! │              Wasmtime                   │
//! └─────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod callback;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod module;
pub mod registry;
pub mod value;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types at crate root
pub use backend::{
    ExportedFunction, GuestContext, GuestEngine, GuestInstance, GuestMemory, HostBridge,
};
pub use callback::{CallbackRef, CallbackTable};
pub use codec::{DEFAULT_MAX_DEPTH, GuestPointer};
pub use config::{BridgeConfig, EngineConfig, ResourceLimits};
pub use dispatcher::{CallPhase, Dispatcher};
pub use engine::{IntoShared, SharedEngine, TetherEngine};
pub use error::{
    CodecError, DispatchError, EngineError, ErrorKind, GuestFault, InstanceError, InvokeError,
    LoadError, Result, TetherError, TrapInfo,
};
pub use module::{
    ExportInfo, ExportKind, ImportInfo, ImportKind, MemoryInfo, ModuleLoader, ModuleMetadata,
    ValidatedModule,
};
pub use registry::{Instance, InstanceId, InstanceRegistry};
pub use value::DynamicValue;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::callback::CallbackRef;
    pub use crate::config::{BridgeConfig, EngineConfig, ResourceLimits};
    pub use crate::dispatcher::Dispatcher;
    pub use crate::error::{DispatchError, ErrorKind, InvokeError, LoadError, Result, TetherError};
    pub use crate::registry::InstanceId;
    pub use crate::value::DynamicValue;
}
