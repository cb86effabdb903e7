//! Guest callback references.
//!
//! A guest hands the host a callback by registering one of its own function
//! indices in its instance's [`CallbackTable`]. The host receives a
//! [`CallbackRef`], which is only an `(instance, slot)` pair: it keeps
//! nothing alive and is checked against the table on every use.
//!
//! Tables are append-only. Releasing a slot or tearing down the owning
//! instance leaves a tombstone in place, so a slot index means the same
//! callback for the whole life of the process or nothing at all.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{InvokeError, InvokeResult};
use crate::registry::InstanceId;

/// A weak, copyable handle to a guest-registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackRef {
    instance_id: InstanceId,
    slot: u32,
}

impl CallbackRef {
    /// Create a reference from its parts.
    pub fn new(instance_id: InstanceId, slot: u32) -> Self {
        Self { instance_id, slot }
    }

    /// The instance that owns the callback.
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// The slot in the owner's callback table.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Pack into the `(instance_id << 32) | slot` form handed to guests.
    pub fn pack(&self) -> u64 {
        (u64::from(self.instance_id.get()) << 32) | u64::from(self.slot)
    }

    /// Inverse of [`pack`](Self::pack). Fails if the instance half is not a
    /// valid id.
    pub fn unpack(packed: u64) -> Option<Self> {
        let instance_id = InstanceId::from_raw((packed >> 32) as u32)?;
        Some(Self::new(instance_id, packed as u32))
    }
}

impl std::fmt::Display for CallbackRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.instance_id, self.slot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Live { guest_index: u32 },
    Tombstone,
}

/// The callback slots owned by one instance.
#[derive(Debug)]
pub struct CallbackTable {
    owner: InstanceId,
    slots: Mutex<Vec<Slot>>,
    retired: AtomicBool,
}

impl CallbackTable {
    /// Create an empty table for an instance.
    pub fn new(owner: InstanceId) -> Self {
        Self {
            owner,
            slots: Mutex::new(Vec::new()),
            retired: AtomicBool::new(false),
        }
    }

    /// The instance this table belongs to.
    pub fn owner(&self) -> InstanceId {
        self.owner
    }

    /// Append a slot for a guest function index.
    ///
    /// Returns `None` once the table has been retired or the slot space is
    /// exhausted.
    pub fn register(&self, guest_index: u32) -> Option<CallbackRef> {
        let mut slots = self.slots.lock();
        if self.is_retired() {
            return None;
        }
        let slot = u32::try_from(slots.len()).ok()?;
        slots.push(Slot::Live { guest_index });
        debug!(instance_id = %self.owner, slot, guest_index, "Registered callback");
        Some(CallbackRef::new(self.owner, slot))
    }

    /// Resolve a reference to the guest function index it names.
    pub fn resolve(&self, callback: CallbackRef) -> InvokeResult<u32> {
        if callback.instance_id() != self.owner {
            return Err(InvokeError::CallbackInvalid(callback));
        }
        let slots = self.slots.lock();
        if self.is_retired() {
            return Err(InvokeError::CallbackInvalid(callback));
        }
        match slots.get(callback.slot() as usize) {
            Some(Slot::Live { guest_index }) => Ok(*guest_index),
            _ => Err(InvokeError::CallbackInvalid(callback)),
        }
    }

    /// Tombstone a single slot. Returns the guest index it held, if it was
    /// live.
    pub fn release(&self, slot: u32) -> Option<u32> {
        let mut slots = self.slots.lock();
        let entry = slots.get_mut(slot as usize)?;
        match std::mem::replace(entry, Slot::Tombstone) {
            Slot::Live { guest_index } => {
                debug!(instance_id = %self.owner, slot, "Released callback");
                Some(guest_index)
            }
            Slot::Tombstone => None,
        }
    }

    /// Tombstone every slot and refuse further registrations.
    ///
    /// Returns the number of slots that were live. Calling this again is a
    /// no-op that returns zero.
    pub fn invalidate_all(&self) -> usize {
        let mut slots = self.slots.lock();
        if self.retired.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let mut invalidated = 0;
        for slot in slots.iter_mut() {
            if let Slot::Live { .. } = slot {
                *slot = Slot::Tombstone;
                invalidated += 1;
            }
        }
        debug!(instance_id = %self.owner, invalidated, "Invalidated callback table");
        invalidated
    }

    /// Whether the owning instance has been torn down.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Total number of slots ever handed out.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Check if no slot was ever handed out.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots that are still live.
    pub fn live_count(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| matches!(s, Slot::Live { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u32) -> InstanceId {
        InstanceId::from_raw(raw).unwrap()
    }

    #[test]
    fn test_register_and_resolve() {
        let table = CallbackTable::new(id(4));

        let first = table.register(10).unwrap();
        let second = table.register(20).unwrap();

        assert_eq!(first, CallbackRef::new(id(4), 0));
        assert_eq!(second.slot(), 1);
        assert_eq!(table.resolve(first).unwrap(), 10);
        assert_eq!(table.resolve(second).unwrap(), 20);
    }

    #[test]
    fn test_released_slot_is_never_reused() {
        let table = CallbackTable::new(id(1));

        let first = table.register(10).unwrap();
        assert_eq!(table.release(first.slot()), Some(10));
        assert_eq!(table.release(first.slot()), None);

        let next = table.register(11).unwrap();
        assert_eq!(next.slot(), 1);
        assert!(matches!(
            table.resolve(first),
            Err(InvokeError::CallbackInvalid(r)) if r == first
        ));
        assert_eq!(table.len(), 2);
        assert_eq!(table.live_count(), 1);
    }

    #[test]
    fn test_invalidate_all_is_idempotent() {
        let table = CallbackTable::new(id(2));
        let a = table.register(1).unwrap();
        table.register(2).unwrap();

        assert_eq!(table.invalidate_all(), 2);
        assert_eq!(table.invalidate_all(), 0);
        assert!(table.is_retired());
        assert!(table.resolve(a).is_err());
        assert!(table.register(3).is_none());
        // Slots are tombstoned in place, not compacted.
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_foreign_reference_is_rejected() {
        let table = CallbackTable::new(id(1));
        table.register(5).unwrap();

        let foreign = CallbackRef::new(id(2), 0);
        assert!(table.resolve(foreign).is_err());
    }

    #[test]
    fn test_pack_round_trip() {
        let r = CallbackRef::new(id(7), 42);
        assert_eq!(r.pack(), (7u64 << 32) | 42);
        assert_eq!(CallbackRef::unpack(r.pack()), Some(r));
        assert_eq!(CallbackRef::unpack(u64::MAX), None);
        assert_eq!(r.to_string(), "7:42");
    }
}
