//! In-memory engine double used by the unit tests.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::backend::{
    CALLBACK_EXPORT, DROP_CALLBACK_EXPORT, ExportedFunction, GuestContext, GuestEngine, GuestInstance, GuestMemory,
    HostBridge, check_bounds,
};
use crate::callback::{CallbackRef, CallbackTable};
use crate::codec::{self, DEFAULT_MAX_DEPTH, GuestPointer};
use crate::error::{CodecResult, GuestFault, InvokeError, InvokeResult, LoadError, LoadResult, TrapInfo};
use crate::registry::InstanceId;
use crate::value::DynamicValue;

/// A bridge that refuses every callback.
struct DetachedBridge;

impl HostBridge for DetachedBridge {
    fn invoke_callback(
        &self,
        callback: CallbackRef,
        _args: Vec<DynamicValue>,
    ) -> InvokeResult<DynamicValue> {
        Err(InvokeError::CallbackInvalid(callback))
    }
}

/// A context whose bridge is already gone.
pub(crate) fn detached_context(instance_id: InstanceId, callbacks: Arc<CallbackTable>) -> GuestContext {
    let bridge: Weak<dyn HostBridge> = Weak::<DetachedBridge>::new();
    GuestContext {
        instance_id,
        callbacks,
        bridge,
        max_depth: DEFAULT_MAX_DEPTH,
    }
}

/// Linear memory backed by a `Vec` with a bump allocator.
pub(crate) struct VecMemory {
    data: Vec<u8>,
    heap: usize,
    reads: Cell<usize>,
    alloc_fault: Option<GuestFault>,
}

impl VecMemory {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            heap: 16,
            reads: Cell::new(0),
            alloc_fault: None,
        }
    }

    /// Number of successful `read_memory` calls so far.
    pub(crate) fn reads(&self) -> usize {
        self.reads.get()
    }
}

impl GuestMemory for VecMemory {
    fn memory_size(&self) -> usize {
        self.data.len()
    }

    fn read_memory(&self, offset: usize, len: usize) -> CodecResult<&[u8]> {
        check_bounds(offset, len, self.data.len())?;
        self.reads.set(self.reads.get() + 1);
        Ok(&self.data[offset..offset + len])
    }

    fn write_memory(&mut self, offset: usize, data: &[u8]) -> CodecResult<()> {
        check_bounds(offset, data.len(), self.data.len())?;
        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn alloc(&mut self, size: u32) -> Result<u32, GuestFault> {
        if let Some(fault) = &self.alloc_fault {
            return Err(fault.clone());
        }
        let offset = self.heap;
        let end = offset + size as usize;
        if end > self.data.len() {
            return Err(GuestFault::Trap(TrapInfo::new("mock heap exhausted")));
        }
        self.heap = end;
        Ok(offset as u32)
    }
}

type ExportFn =
    Arc<dyn Fn(&GuestContext, Vec<DynamicValue>) -> Result<DynamicValue, GuestFault> + Send + Sync>;

/// A module the mock engine knows how to instantiate.
#[derive(Clone, Default)]
pub(crate) struct MockModule {
    exports: HashMap<String, (usize, ExportFn)>,
    on_instantiate: Option<Arc<dyn Fn(&GuestContext) + Send + Sync>>,
    fail_instantiation: Option<String>,
    alloc_fault: Option<GuestFault>,
}

impl MockModule {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add an export. The callback export receives `[Integer(index), args]`
    /// and the drop export `[Integer(index)]`.
    pub(crate) fn export(
        mut self,
        name: &str,
        arity: usize,
        f: impl Fn(&GuestContext, Vec<DynamicValue>) -> Result<DynamicValue, GuestFault>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.exports.insert(name.to_string(), (arity, Arc::new(f)));
        self
    }

    pub(crate) fn on_instantiate(mut self, f: impl Fn(&GuestContext) + Send + Sync + 'static) -> Self {
        self.on_instantiate = Some(Arc::new(f));
        self
    }

    pub(crate) fn failing(mut self, message: &str) -> Self {
        self.fail_instantiation = Some(message.to_string());
        self
    }

    pub(crate) fn with_alloc_fault(mut self, fault: GuestFault) -> Self {
        self.alloc_fault = Some(fault);
        self
    }
}

/// Engine double keyed by module bytes.
#[derive(Default)]
pub(crate) struct MockEngine {
    modules: HashMap<Vec<u8>, MockModule>,
    calls: Arc<AtomicUsize>,
    interrupts: AtomicUsize,
}

impl MockEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_module(mut self, bytes: &[u8], module: MockModule) -> Self {
        self.modules.insert(bytes.to_vec(), module);
        self
    }

    /// Number of export calls that reached the engine.
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }
}

impl GuestEngine for MockEngine {
    fn instantiate(
        &self,
        bytes: &[u8],
        context: GuestContext,
    ) -> LoadResult<Box<dyn GuestInstance>> {
        let module = self
            .modules
            .get(bytes)
            .ok_or_else(|| LoadError::InvalidModule("unknown mock module".into()))?;
        if let Some(message) = &module.fail_instantiation {
            return Err(LoadError::InstantiationFailed(message.clone()));
        }
        if let Some(hook) = &module.on_instantiate {
            hook(&context);
        }
        let mut memory = VecMemory::new(64 * 1024);
        memory.alloc_fault = module.alloc_fault.clone();
        Ok(Box::new(MockInstance {
            memory,
            exports: module.exports.clone(),
            context,
            calls: Arc::clone(&self.calls),
        }))
    }

    fn interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockInstance {
    memory: VecMemory,
    exports: HashMap<String, (usize, ExportFn)>,
    context: GuestContext,
    calls: Arc<AtomicUsize>,
}

impl GuestMemory for MockInstance {
    fn memory_size(&self) -> usize {
        self.memory.memory_size()
    }

    fn read_memory(&self, offset: usize, len: usize) -> CodecResult<&[u8]> {
        self.memory.read_memory(offset, len)
    }

    fn write_memory(&mut self, offset: usize, data: &[u8]) -> CodecResult<()> {
        self.memory.write_memory(offset, data)
    }

    fn alloc(&mut self, size: u32) -> Result<u32, GuestFault> {
        self.memory.alloc(size)
    }
}

impl GuestInstance for MockInstance {
    fn get_export(&mut self, name: &str) -> Option<ExportedFunction> {
        self.exports.get(name).map(|(arity, _)| ExportedFunction {
            instance_id: self.context.instance_id,
            name: name.to_string(),
            arity: *arity,
        })
    }

    fn call_export(
        &mut self,
        export: &ExportedFunction,
        args: &[u64],
    ) -> Result<Option<u64>, GuestFault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (arity, f) = self
            .exports
            .get(&export.name)
            .cloned()
            .ok_or_else(|| GuestFault::Trap(TrapInfo::new("export vanished")))?;
        if args.len() != arity {
            return Err(GuestFault::Trap(TrapInfo::new(format!(
                "expected {arity} arguments, got {}",
                args.len()
            ))));
        }

        let decode = |memory: &VecMemory, packed: u64| {
            codec::decode(GuestPointer::unpack(packed), memory, DEFAULT_MAX_DEPTH)
                .map_err(|e| GuestFault::Trap(TrapInfo::new(e.to_string())))
        };
        let values = if export.name == CALLBACK_EXPORT {
            vec![
                DynamicValue::Integer(args[0] as i64),
                decode(&self.memory, args[1])?,
            ]
        } else if export.name == DROP_CALLBACK_EXPORT {
            vec![DynamicValue::Integer(args[0] as i64)]
        } else {
            args.iter()
                .map(|packed| decode(&self.memory, *packed))
                .collect::<Result<Vec<_>, _>>()?
        };

        let result = f(&self.context, values)?;
        let pointer = codec::encode(&result, &mut self.memory, DEFAULT_MAX_DEPTH)
            .map_err(|e| GuestFault::Trap(TrapInfo::new(e.to_string())))?;
        Ok(Some(pointer.pack()))
    }
}
