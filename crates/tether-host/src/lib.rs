//! Tether Host - the Wasmtime side of the guest bridge
//!
//! This crate runs guest modules for the bridge in `tether-core`. It
//! includes:
//!
//! - [`WasmtimeBackend`]: the [`GuestEngine`](tether_core::GuestEngine)
//!   implementation, one store per instance
//! - [`TetherLinker`]: Wasmtime's `Linker` with the `tether` host imports
//! - [`HostContext`]: guest memory and allocator as seen from a host import
//!
//! # Host imports
//!
//! Guests import `register_callback`, `release_callback`, `invoke_callback`
//! and `log` from the `tether` module. A host import that fails traps the
//! guest that called it; a failure coming from a nested call is reported to
//! the outer caller unchanged.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tether_core::{DEFAULT_MAX_DEPTH, Dispatcher, IntoShared, ResourceLimits, TetherEngine};
//! use tether_host::WasmtimeBackend;
//!
//! let engine = TetherEngine::default_engine()?.into_shared();
//! let backend = WasmtimeBackend::new(engine, ResourceLimits::default())?;
//! let bridge = Dispatcher::new(Arc::new(backend), DEFAULT_MAX_DEPTH, events);
//! let id = bridge.load(&wasm)?;
//! ```

pub mod context;
pub mod error;
pub mod linker;
pub mod sandbox;

// Re-export main types
pub use context::{GuestState, HostContext};
pub use error::{HostError, HostResult};
pub use linker::{INVALID_CALLBACK, RegisteredFunction, TetherLinker};
pub use sandbox::{WasmtimeBackend, WasmtimeGuest};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::context::HostContext;
    pub use crate::error::{HostError, HostResult};
    pub use crate::sandbox::WasmtimeBackend;
}
