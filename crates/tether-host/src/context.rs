//! Host-side view of a guest instance.
//!
//! [`GuestState`] is the data every Wasmtime store carries: the bridge
//! context of the instance plus its resource limiter. [`HostContext`] wraps
//! the `Caller` a host import receives and exposes the guest's memory and
//! allocator through [`GuestMemory`], so host imports use the same codec as
//! the dispatcher.

use tether_core::backend::{ALLOC_EXPORT, MEMORY_EXPORT, check_bounds};
use tether_core::codec::{self, GuestPointer};
use tether_core::error::CodecResult;
use tether_core::{DynamicValue, GuestContext, GuestFault, GuestMemory, TrapInfo};
use wasmtime::{AsContextMut, Caller, Extern, Memory, StoreLimits, TypedFunc};

use crate::error::{HostError, HostResult};
use crate::sandbox::classify_error;

/// Data stored in every guest store.
pub struct GuestState {
    context: GuestContext,
    pub(crate) limits: StoreLimits,
}

impl GuestState {
    /// Create store data for an instance.
    pub fn new(context: GuestContext, limits: StoreLimits) -> Self {
        Self { context, limits }
    }

    /// The bridge context of the instance.
    pub fn context(&self) -> &GuestContext {
        &self.context
    }
}

impl std::fmt::Debug for GuestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestState")
            .field("context", &self.context)
            .finish()
    }
}

/// Context available to host import implementations.
pub struct HostContext<'a> {
    caller: Caller<'a, GuestState>,
    memory: Memory,
}

impl<'a> HostContext<'a> {
    /// Wrap a caller. Fails if the guest exports no memory.
    pub fn new(mut caller: Caller<'a, GuestState>) -> HostResult<Self> {
        let memory = caller
            .get_export(MEMORY_EXPORT)
            .and_then(Extern::into_memory)
            .ok_or(HostError::MemoryNotFound)?;
        Ok(Self { caller, memory })
    }

    /// The bridge context of the calling instance.
    pub fn guest(&self) -> &GuestContext {
        self.caller.data().context()
    }

    /// Read a UTF-8 string, replacing invalid sequences.
    pub fn read_string_lossy(&self, offset: usize, len: usize) -> HostResult<String> {
        let bytes = self.read_memory(offset, len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Decode the value a packed guest pointer refers to.
    pub fn decode_value(&self, packed: u64) -> HostResult<DynamicValue> {
        let max_depth = self.guest().max_depth;
        Ok(codec::decode(GuestPointer::unpack(packed), self, max_depth)?)
    }

    /// Encode a value into guest memory.
    pub fn encode_value(&mut self, value: &DynamicValue) -> HostResult<GuestPointer> {
        let max_depth = self.guest().max_depth;
        codec::encode(value, self, max_depth).map_err(HostError::from_codec)
    }
}

impl GuestMemory for HostContext<'_> {
    fn memory_size(&self) -> usize {
        self.memory.data_size(&self.caller)
    }

    fn read_memory(&self, offset: usize, len: usize) -> CodecResult<&[u8]> {
        let data = self.memory.data(&self.caller);
        check_bounds(offset, len, data.len())?;
        Ok(&data[offset..offset + len])
    }

    fn write_memory(&mut self, offset: usize, bytes: &[u8]) -> CodecResult<()> {
        let data = self.memory.data_mut(&mut self.caller);
        check_bounds(offset, bytes.len(), data.len())?;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn alloc(&mut self, size: u32) -> Result<u32, GuestFault> {
        let func = self
            .caller
            .get_export(ALLOC_EXPORT)
            .and_then(Extern::into_func)
            .ok_or_else(missing_alloc)?;
        let alloc = func.typed::<i32, i32>(&self.caller).map_err(|e| {
            GuestFault::Trap(TrapInfo::new(format!(
                "'{ALLOC_EXPORT}' has the wrong signature: {e}"
            )))
        })?;
        call_alloc(&mut self.caller, &alloc, size)
    }
}

impl std::fmt::Debug for HostContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("instance_id", &self.guest().instance_id)
            .field("memory_size", &self.memory_size())
            .finish()
    }
}

pub(crate) fn missing_alloc() -> GuestFault {
    GuestFault::Trap(TrapInfo::new(format!(
        "module does not export '{ALLOC_EXPORT}'; the host cannot pass values to it"
    )))
}

/// Run the guest allocator.
///
/// A trap inside the allocator leaves the guest heap in an unknown state,
/// so it is reported as poisoning the instance.
pub(crate) fn call_alloc(
    store: impl AsContextMut<Data = GuestState>,
    alloc: &TypedFunc<i32, i32>,
    size: u32,
) -> Result<u32, GuestFault> {
    let size = i32::try_from(size).map_err(|_| {
        GuestFault::Trap(TrapInfo::new(format!(
            "allocation of {size} bytes exceeds the guest address space"
        )))
    })?;
    match alloc.call(store, size) {
        Ok(offset) => Ok(offset as u32),
        Err(err) => Err(match classify_error(err) {
            GuestFault::Trap(info) => GuestFault::Poisoned(info),
            other => other,
        }),
    }
}
