//! The call dispatcher.
//!
//! Every request into a guest goes through [`Dispatcher`]: plain export calls,
//! the command-style `run` entry point, host-initiated callback invocations,
//! and callbacks a guest invokes through its host imports. A call moves
//! through the phases of [`CallPhase`]; whichever phase it fails in is
//! recorded in the log and in the [`BridgeEvent::CallCompleted`] event.

use std::sync::{Arc, Weak};
use std::time::Instant;

use tether_observe::{BridgeEvent, CallId, CallOutcome, EventDispatcher};
use tracing::{debug, info, warn};

use crate::backend::{
    CALLBACK_EXPORT, DROP_CALLBACK_EXPORT, GuestContext, GuestEngine, HostBridge, RUN_EXPORT,
};
use crate::callback::CallbackRef;
use crate::codec::{self, GuestPointer};
use crate::error::{
    CodecError, DispatchError, DispatchResult, GuestFault, InstanceError, InvokeError,
    InvokeResult, LoadResult, TrapInfo,
};
use crate::registry::{Instance, InstanceId, InstanceRegistry};
use crate::value::DynamicValue;

/// Where a call is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// Finding the instance and the export.
    Resolving,
    /// Writing arguments into guest memory.
    Encoding,
    /// Running guest code.
    Executing,
    /// Reading the result out of guest memory.
    Decoding,
    /// Finished successfully.
    Done,
}

impl CallPhase {
    /// Lowercase phase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CallPhase::Resolving => "resolving",
            CallPhase::Encoding => "encoding",
            CallPhase::Executing => "executing",
            CallPhase::Decoding => "decoding",
            CallPhase::Done => "done",
        }
    }
}

impl std::fmt::Display for CallPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One argument slot of an export call.
#[derive(Debug, Clone, Copy)]
enum CallArg<'a> {
    /// Passed through as-is.
    Raw(u64),
    /// Encoded into guest memory and passed as a packed pointer.
    Value(&'a DynamicValue),
}

/// The single entry point for calls across the guest boundary.
///
/// A dispatcher owns the [`InstanceRegistry`] and drives the engine through
/// the [`GuestEngine`] capability. It is always handled through an `Arc`:
/// instances reach back into it through a weak [`HostBridge`] reference.
pub struct Dispatcher {
    this: Weak<Dispatcher>,
    engine: Arc<dyn GuestEngine>,
    registry: InstanceRegistry,
    events: Arc<EventDispatcher>,
    max_depth: usize,
}

impl Dispatcher {
    /// Create a dispatcher over an engine.
    pub fn new(
        engine: Arc<dyn GuestEngine>,
        max_depth: usize,
        events: Arc<EventDispatcher>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            engine,
            registry: InstanceRegistry::new(),
            events,
            max_depth,
        })
    }

    /// Load module bytes and register the resulting instance.
    pub fn load(&self, bytes: &[u8]) -> LoadResult<InstanceId> {
        let started = Instant::now();
        let bridge: Weak<dyn HostBridge> = self.this.clone();

        let result = self.registry.load(|instance_id, callbacks| {
            let context = GuestContext {
                instance_id,
                callbacks,
                bridge,
                max_depth: self.max_depth,
            };
            self.engine.instantiate(bytes, context)
        });

        match result {
            Ok(instance) => {
                self.events.emit(BridgeEvent::InstanceLoaded {
                    instance_id: instance.id().get(),
                    duration_us: started.elapsed().as_micros() as u64,
                });
                Ok(instance.id())
            }
            Err(err) => {
                warn!(kind = %err.kind(), "Load failed: {err}");
                self.events.emit(BridgeEvent::LoadFailed {
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Call an export by exact name.
    pub fn call(
        &self,
        id: InstanceId,
        function: &str,
        args: &[DynamicValue],
    ) -> DispatchResult<DynamicValue> {
        let args: Vec<CallArg<'_>> = args.iter().map(CallArg::Value).collect();
        self.dispatch(id, function, &args)
    }

    /// Call the `run` export with no arguments.
    pub fn run(&self, id: InstanceId) -> DispatchResult<DynamicValue> {
        self.call(id, RUN_EXPORT, &[])
    }

    /// Remove an instance. Its callback references become invalid at once.
    pub fn unload(&self, id: InstanceId) -> Result<(), InstanceError> {
        let callbacks_invalidated = self.registry.unload(id)?;
        info!(instance_id = %id, callbacks_invalidated, "Unloaded instance");
        self.events.emit(BridgeEvent::InstanceUnloaded {
            instance_id: id.get(),
            callbacks_invalidated,
        });
        Ok(())
    }

    /// Register a guest function index as a callback of an instance.
    pub fn register_callback(
        &self,
        id: InstanceId,
        guest_index: u32,
    ) -> Result<CallbackRef, InstanceError> {
        let instance = self.registry.resolve(id)?;
        let callback = instance
            .callbacks()
            .register(guest_index)
            .ok_or(InstanceError::NotFound(id))?;
        self.events.emit(BridgeEvent::CallbackRegistered {
            instance_id: id.get(),
            slot: callback.slot(),
        });
        Ok(callback)
    }

    /// Invoke a callback and discard its result.
    ///
    /// When `name_hint` is given it is passed as the first argument.
    pub fn invoke(
        &self,
        callback: CallbackRef,
        name_hint: Option<&str>,
        args: Vec<DynamicValue>,
    ) -> InvokeResult<()> {
        self.invoke_returning(callback, name_hint, args).map(drop)
    }

    /// Invoke a callback and return what the guest returned.
    pub fn invoke_returning(
        &self,
        callback: CallbackRef,
        name_hint: Option<&str>,
        args: Vec<DynamicValue>,
    ) -> InvokeResult<DynamicValue> {
        let instance = self
            .registry
            .resolve(callback.instance_id())
            .map_err(|_| InvokeError::CallbackInvalid(callback))?;
        let guest_index = instance.callbacks().resolve(callback)?;

        let mut values = Vec::with_capacity(args.len() + 1);
        if let Some(name) = name_hint {
            values.push(DynamicValue::from(name));
        }
        values.extend(args);
        let payload = DynamicValue::Array(values);

        debug!(callback = %callback, guest_index, name_hint = ?name_hint, "Invoking callback");
        self.events.emit(BridgeEvent::CallbackInvoked {
            instance_id: callback.instance_id().get(),
            slot: callback.slot(),
            name_hint: name_hint.map(str::to_string),
        });

        let args = [CallArg::Raw(u64::from(guest_index)), CallArg::Value(&payload)];
        match self.dispatch(callback.instance_id(), CALLBACK_EXPORT, &args) {
            Ok(value) => Ok(value),
            // Unloaded between resolution and dispatch.
            Err(DispatchError::Instance(_)) => Err(InvokeError::CallbackInvalid(callback)),
            Err(err) => Err(err.into()),
        }
    }

    /// Release one callback reference.
    ///
    /// The slot is tombstoned; if the guest exports `tether_drop_callback`
    /// it is told which function index was dropped. The release stands even
    /// when that notification fails, so the failure is only logged.
    pub fn release_callback(&self, callback: CallbackRef) -> InvokeResult<()> {
        let instance = self
            .registry
            .resolve(callback.instance_id())
            .map_err(|_| InvokeError::CallbackInvalid(callback))?;
        instance.callbacks().resolve(callback)?;
        let guest_index = instance
            .callbacks()
            .release(callback.slot())
            .ok_or(InvokeError::CallbackInvalid(callback))?;

        self.events.emit(BridgeEvent::CallbackReleased {
            instance_id: callback.instance_id().get(),
            slot: callback.slot(),
        });

        if !instance.is_poisoned() {
            if let Err(err) = self.notify_drop(&instance, guest_index) {
                warn!(
                    callback = %callback,
                    guest_index,
                    kind = %err.kind(),
                    "Guest was not told about a released callback: {err}"
                );
            }
        }
        Ok(())
    }

    /// Stop whatever guest code is running. The interrupted call fails with
    /// [`DispatchError::Cancelled`]; the instance stays usable.
    pub fn interrupt(&self) {
        info!("Interrupting guest execution");
        self.engine.interrupt();
        self.events.emit(BridgeEvent::Interrupted);
    }

    /// Ids of all live instances, ascending.
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.registry.ids()
    }

    /// Check whether an id names a live instance.
    pub fn is_loaded(&self, id: InstanceId) -> bool {
        self.registry.contains(id)
    }

    /// Check whether a live instance has been poisoned.
    pub fn is_poisoned(&self, id: InstanceId) -> Result<bool, InstanceError> {
        Ok(self.registry.resolve(id)?.is_poisoned())
    }

    /// The nesting limit applied to values in both directions.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// The event dispatcher this bridge reports to.
    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    fn dispatch(
        &self,
        id: InstanceId,
        function: &str,
        args: &[CallArg<'_>],
    ) -> DispatchResult<DynamicValue> {
        let call_id = CallId::new();
        let started = Instant::now();
        self.events.emit(BridgeEvent::CallStarted {
            call_id,
            instance_id: id.get(),
            function: function.to_string(),
        });
        debug!(call_id = %call_id, instance_id = %id, function, "Dispatching call");

        let mut phase = CallPhase::Resolving;
        let result = self.execute(id, function, args, &mut phase);

        let outcome = match &result {
            Ok(_) => CallOutcome::Success,
            Err(err) => {
                debug!(
                    call_id = %call_id,
                    instance_id = %id,
                    function,
                    phase = %phase,
                    kind = %err.kind(),
                    "Call failed"
                );
                CallOutcome::Failed {
                    phase: phase.to_string(),
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                }
            }
        };
        self.events.emit(BridgeEvent::CallCompleted {
            call_id,
            instance_id: id.get(),
            function: function.to_string(),
            outcome,
            duration_us: started.elapsed().as_micros() as u64,
        });
        result
    }

    fn execute(
        &self,
        id: InstanceId,
        function: &str,
        args: &[CallArg<'_>],
        phase: &mut CallPhase,
    ) -> DispatchResult<DynamicValue> {
        let instance = self.registry.resolve(id)?;
        if instance.is_poisoned() {
            return Err(DispatchError::Trap(TrapInfo::poisoned(id)));
        }

        instance.enter(|guest| {
            let export = guest
                .get_export(function)
                .ok_or_else(|| DispatchError::FunctionNotFound(function.to_string()))?;

            *phase = CallPhase::Encoding;
            let mut packed = Vec::with_capacity(args.len());
            for arg in args {
                let raw = match arg {
                    CallArg::Raw(raw) => *raw,
                    CallArg::Value(value) => codec::encode(value, &mut *guest, self.max_depth)
                        .map_err(|err| self.codec_failure(&instance, err))?
                        .pack(),
                };
                packed.push(raw);
            }

            *phase = CallPhase::Executing;
            let result = guest
                .call_export(&export, &packed)
                .map_err(|fault| self.fault(&instance, fault))?;

            *phase = CallPhase::Decoding;
            let value = match result {
                Some(raw) => codec::decode(GuestPointer::unpack(raw), &*guest, self.max_depth)?,
                None => DynamicValue::Nil,
            };

            *phase = CallPhase::Done;
            Ok(value)
        })
    }

    fn notify_drop(&self, instance: &Instance, guest_index: u32) -> DispatchResult<()> {
        let exported =
            instance.enter(|guest| Ok(guest.get_export(DROP_CALLBACK_EXPORT).is_some()))?;
        if exported {
            let args = [CallArg::Raw(u64::from(guest_index))];
            self.dispatch(instance.id(), DROP_CALLBACK_EXPORT, &args)?;
        }
        Ok(())
    }

    fn codec_failure(&self, instance: &Instance, err: CodecError) -> DispatchError {
        match err {
            CodecError::Alloc(fault) => self.fault(instance, fault),
            other => other.into(),
        }
    }

    fn fault(&self, instance: &Instance, fault: GuestFault) -> DispatchError {
        if let GuestFault::Poisoned(info) = &fault {
            if instance.poison() {
                warn!(instance_id = %instance.id(), "Instance poisoned: {info}");
                self.events.emit(BridgeEvent::InstancePoisoned {
                    instance_id: instance.id().get(),
                    message: info.to_string(),
                });
            }
        }
        DispatchError::from(fault)
    }
}

impl HostBridge for Dispatcher {
    fn invoke_callback(
        &self,
        callback: CallbackRef,
        args: Vec<DynamicValue>,
    ) -> InvokeResult<DynamicValue> {
        self.invoke_returning(callback, None, args)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("max_depth", &self.max_depth)
            .field("events", &self.events)
            .finish()
    }
}
