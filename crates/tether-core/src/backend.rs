//! The execution-engine capability the bridge is built on.
//!
//! The dispatcher never talks to a concrete sandbox. It needs something that
//! can instantiate module bytes ([`GuestEngine`]), find and call exports and
//! touch linear memory ([`GuestInstance`], [`GuestMemory`]), and it hands the
//! engine a [`GuestContext`] so guest imports can reach back into the bridge
//! through [`HostBridge`]. `tether-host` implements these traits on top of
//! Wasmtime; tests use an in-memory double.

use std::sync::{Arc, Weak};

use crate::callback::{CallbackRef, CallbackTable};
use crate::error::{CodecError, CodecResult, GuestFault, InvokeResult, LoadResult};
use crate::registry::InstanceId;
use crate::value::DynamicValue;

/// Name of the linear memory export.
pub const MEMORY_EXPORT: &str = "memory";

/// Name of the guest allocator export, `alloc(size: i32) -> i32`.
pub const ALLOC_EXPORT: &str = "alloc";

/// Export that receives host-initiated callback invocations,
/// `tether_call_callback(index: i64, args: i64) [-> i64]`.
pub const CALLBACK_EXPORT: &str = "tether_call_callback";

/// Optional export told when the host releases a callback,
/// `tether_drop_callback(index: i64)`.
pub const DROP_CALLBACK_EXPORT: &str = "tether_drop_callback";

/// Export called by the command-style entry point.
pub const RUN_EXPORT: &str = "run";

/// Import module under which host functions are offered to guests.
pub const HOST_MODULE: &str = "tether";

/// Functions offered under [`HOST_MODULE`].
pub const HOST_IMPORTS: &[&str] = &["register_callback", "release_callback", "invoke_callback", "log"];

/// Access to one instance's linear memory.
pub trait GuestMemory {
    /// Current size of linear memory in bytes.
    fn memory_size(&self) -> usize;

    /// Borrow `len` bytes at `offset`. Must fail without reading when the
    /// region is not entirely inside linear memory.
    fn read_memory(&self, offset: usize, len: usize) -> CodecResult<&[u8]>;

    /// Copy `data` to `offset`. Must fail without writing when the region is
    /// not entirely inside linear memory.
    fn write_memory(&mut self, offset: usize, data: &[u8]) -> CodecResult<()>;

    /// Ask the guest allocator for `size` bytes and return their offset.
    fn alloc(&mut self, size: u32) -> Result<u32, GuestFault>;
}

/// Check that `[offset, offset + len)` lies inside a memory of
/// `memory_size` bytes.
pub fn check_bounds(offset: usize, len: usize, memory_size: usize) -> CodecResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= memory_size => Ok(()),
        _ => Err(CodecError::OutOfBounds {
            offset: offset as u64,
            len: len as u64,
            memory_size: memory_size as u64,
        }),
    }
}

/// A resolved function export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedFunction {
    /// The instance exporting the function.
    pub instance_id: InstanceId,
    /// Exact export name.
    pub name: String,
    /// Number of parameters the guest declared.
    pub arity: usize,
}

/// One live guest instance inside an engine.
pub trait GuestInstance: GuestMemory + Send {
    /// Look up a function export by exact name.
    fn get_export(&mut self, name: &str) -> Option<ExportedFunction>;

    /// Call an export with packed arguments. Returns the packed result, or
    /// `None` when the export declares no result.
    fn call_export(
        &mut self,
        export: &ExportedFunction,
        args: &[u64],
    ) -> Result<Option<u64>, GuestFault>;
}

/// The way back from guest imports into the bridge.
pub trait HostBridge: Send + Sync {
    /// Invoke a callback on behalf of a guest.
    fn invoke_callback(
        &self,
        callback: CallbackRef,
        args: Vec<DynamicValue>,
    ) -> InvokeResult<DynamicValue>;
}

/// Everything an engine needs to wire an instance to the bridge.
#[derive(Clone)]
pub struct GuestContext {
    /// Id reserved for the instance being created.
    pub instance_id: InstanceId,
    /// The instance's callback table, shared with the registry.
    pub callbacks: Arc<CallbackTable>,
    /// The bridge, held weakly so instances never keep it alive.
    pub bridge: Weak<dyn HostBridge>,
    /// Nesting limit for values decoded inside host imports.
    pub max_depth: usize,
}

impl std::fmt::Debug for GuestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestContext")
            .field("instance_id", &self.instance_id)
            .field("callbacks", &self.callbacks.len())
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

/// A sandboxed execution engine.
pub trait GuestEngine: Send + Sync {
    /// Compile and instantiate module bytes.
    fn instantiate(
        &self,
        bytes: &[u8],
        context: GuestContext,
    ) -> LoadResult<Box<dyn GuestInstance>>;

    /// Stop whatever guest code is running, if the engine supports it.
    fn interrupt(&self);
}
