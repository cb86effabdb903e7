//! The instance registry.
//!
//! Owns every live guest instance and hands out [`InstanceId`]s. Ids are
//! assigned from a counter that only moves forward, so an id that has been
//! unloaded can never come to name a different instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::backend::GuestInstance;
use crate::callback::CallbackTable;
use crate::error::{DispatchError, InstanceError, LoadError, LoadResult};

/// Handle of a loaded instance.
///
/// Ids live in the non-negative `i32` range so they can be passed to guests
/// as plain wasm integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u32);

impl InstanceId {
    /// Largest valid id.
    pub const MAX: u32 = i32::MAX as u32;

    /// Wrap a raw id. Returns `None` above [`InstanceId::MAX`].
    pub fn from_raw(raw: u32) -> Option<Self> {
        (raw <= Self::MAX).then_some(Self(raw))
    }

    /// The raw id.
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which thread is inside each instance, and which instance each blocked
/// thread is waiting to enter.
#[derive(Debug, Default)]
struct EntryGraph {
    owners: HashMap<InstanceId, ThreadId>,
    waiting: HashMap<ThreadId, InstanceId>,
}

impl EntryGraph {
    /// Check whether `thread` blocking on `target` would never wake up:
    /// following owner and wait edges from `target` leads back to `thread`.
    fn closes_cycle(&self, thread: ThreadId, target: InstanceId) -> bool {
        let mut next = target;
        for _ in 0..=self.waiting.len() {
            let Some(owner) = self.owners.get(&next) else {
                return false;
            };
            if *owner == thread {
                return true;
            }
            match self.waiting.get(owner) {
                Some(instance) => next = *instance,
                None => return false,
            }
        }
        false
    }
}

/// Records the current thread as the owner of an instance until dropped.
struct Occupancy<'a> {
    graph: &'a Mutex<EntryGraph>,
    id: InstanceId,
}

impl<'a> Occupancy<'a> {
    fn claim(graph: &'a Mutex<EntryGraph>, id: InstanceId, thread: ThreadId) -> Self {
        let mut entries = graph.lock();
        entries.waiting.remove(&thread);
        entries.owners.insert(id, thread);
        Self { graph, id }
    }
}

impl Drop for Occupancy<'_> {
    fn drop(&mut self) {
        self.graph.lock().owners.remove(&self.id);
    }
}

/// One loaded guest module.
///
/// The engine state sits behind a lock: calls from other threads wait their
/// turn. An entry that could never be granted fails instead of waiting,
/// whether it re-enters the instance from its own call stack or closes a
/// cycle of threads each waiting on an instance another one holds.
pub struct Instance {
    id: InstanceId,
    guest: Mutex<Box<dyn GuestInstance>>,
    callbacks: Arc<CallbackTable>,
    poisoned: AtomicBool,
    entries: Arc<Mutex<EntryGraph>>,
}

impl Instance {
    fn new(
        id: InstanceId,
        guest: Box<dyn GuestInstance>,
        callbacks: Arc<CallbackTable>,
        entries: Arc<Mutex<EntryGraph>>,
    ) -> Self {
        Self {
            id,
            guest: Mutex::new(guest),
            callbacks,
            poisoned: AtomicBool::new(false),
            entries,
        }
    }

    /// The instance id.
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// The instance's callback table.
    pub fn callbacks(&self) -> &Arc<CallbackTable> {
        &self.callbacks
    }

    /// Check whether the instance refuses further calls.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Mark the instance poisoned. Returns `true` if it was not already.
    pub fn poison(&self) -> bool {
        !self.poisoned.swap(true, Ordering::SeqCst)
    }

    /// Run `f` with exclusive access to the engine state.
    ///
    /// Fails with [`DispatchError::Reentrant`] when the current thread is
    /// already inside this instance, or when waiting for it would deadlock
    /// with threads inside other instances.
    pub fn enter<R>(
        &self,
        f: impl FnOnce(&mut dyn GuestInstance) -> Result<R, DispatchError>,
    ) -> Result<R, DispatchError> {
        let thread = thread::current().id();
        {
            let mut entries = self.entries.lock();
            if entries.closes_cycle(thread, self.id) {
                debug!(instance_id = %self.id, "Refusing entry that would deadlock");
                return Err(DispatchError::Reentrant(self.id));
            }
            entries.waiting.insert(thread, self.id);
        }

        let mut guest = self.guest.lock();
        let _occupancy = Occupancy::claim(&self.entries, self.id, thread);
        f(&mut **guest)
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("callbacks", &self.callbacks.len())
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

/// The set of live instances.
#[derive(Default)]
pub struct InstanceRegistry {
    instances: DashMap<InstanceId, Arc<Instance>>,
    next_id: Mutex<u32>,
    entries: Arc<Mutex<EntryGraph>>,
}

impl InstanceRegistry {
    /// Create an empty registry. The first id handed out is `0`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiate and register a new instance.
    ///
    /// `instantiate` receives the id the instance will get and its fresh
    /// callback table. The id counter is held for the duration and only
    /// advances when instantiation succeeds, so a failed load leaves neither
    /// an instance nor a gap in the id sequence.
    pub fn load<F>(&self, instantiate: F) -> LoadResult<Arc<Instance>>
    where
        F: FnOnce(InstanceId, Arc<CallbackTable>) -> LoadResult<Box<dyn GuestInstance>>,
    {
        let mut next_id = self.next_id.lock();
        let id = InstanceId::from_raw(*next_id).ok_or_else(|| {
            LoadError::InstantiationFailed("instance id space exhausted".to_string())
        })?;

        let callbacks = Arc::new(CallbackTable::new(id));
        let guest = match instantiate(id, Arc::clone(&callbacks)) {
            Ok(guest) => guest,
            Err(err) => {
                // Anything the start function registered dies with it.
                callbacks.invalidate_all();
                return Err(err);
            }
        };

        let instance = Arc::new(Instance::new(id, guest, callbacks, Arc::clone(&self.entries)));
        self.instances.insert(id, Arc::clone(&instance));
        *next_id += 1;

        info!(instance_id = %id, "Registered instance");
        Ok(instance)
    }

    /// Look up a live instance.
    pub fn resolve(&self, id: InstanceId) -> Result<Arc<Instance>, InstanceError> {
        self.instances
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(InstanceError::NotFound(id))
    }

    /// Remove an instance and invalidate its callbacks.
    ///
    /// Returns the number of callback slots that were still live. A call
    /// already running in the instance keeps it alive until it returns.
    pub fn unload(&self, id: InstanceId) -> Result<usize, InstanceError> {
        let (_, instance) = self
            .instances
            .remove(&id)
            .ok_or(InstanceError::NotFound(id))?;
        let invalidated = instance.callbacks.invalidate_all();
        debug!(instance_id = %id, invalidated, "Removed instance");
        Ok(invalidated)
    }

    /// Check whether an id names a live instance.
    pub fn contains(&self, id: InstanceId) -> bool {
        self.instances.contains_key(&id)
    }

    /// Ids of all live instances, ascending.
    pub fn ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<_> = self.instances.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Check if no instance is loaded.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl Drop for InstanceRegistry {
    fn drop(&mut self) {
        for entry in self.instances.iter() {
            entry.value().callbacks.invalidate_all();
        }
    }
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("instances", &self.ids())
            .field("next_id", &*self.next_id.lock())
            .finish()
    }
}
