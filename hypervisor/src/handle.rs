//! Handles: the capability objects a guest references by small integer.
//!
//! Grounded on `original_source/include/handle.h`, which uses a struct with
//! one pointer per capability variant (all but one null) plus an `ops`
//! vtable exposing a single `reset` hook. Per SPEC_FULL.md §9 Design Notes,
//! this is reimplemented as a tagged variant carrying the capability's own
//! index rather than a pointer, with `reset` as an ordinary match arm
//! instead of a vtable call.

use crate::config::{GLOBAL_HANDLES, MAX_GUEST_HANDLES};
use core::sync::atomic::{AtomicU32, Ordering};

/// Opaque identifier for a [`Handle`] within a guest's (or the global)
/// handle table. Indices `0..GLOBAL_HANDLES` are reserved for
/// hypervisor-global objects; a guest's own handles start at
/// `GLOBAL_HANDLES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct HandleId(pub(crate) u32);

/// The capability set a [`Handle`] may carry, per SPEC_FULL.md §3.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Handle {
    ByteChan { endpoint: u32 },
    Interrupt { irq: u32 },
    Doorbell { target_vcpu: u32 },
    Pamu { liodn: u32 },
    Partition { guest: crate::guest::GuestId },
    ErrorQueue,
}

impl Handle {
    /// Invoked on partition stop for every handle the stopping vCPU owns.
    /// This replaces the reference's per-variant `ops->reset` vtable call
    /// with a plain match.
    pub(crate) fn reset(&mut self) {
        match self {
            Self::ByteChan { .. } | Self::Interrupt { .. } | Self::Doorbell { .. } => {
                // Transport-level state lives in the out-of-scope console/IRQ
                // drivers; nothing to do here beyond the slot becoming free.
            }
            Self::Pamu { .. } | Self::Partition { .. } | Self::ErrorQueue => {}
        }
    }
}

/// A bounded table of optional handles, backed by first-free-slot CAS
/// allocation so concurrent `alloc` calls never race onto the same index.
///
/// One instance serves the hypervisor-global table (`GLOBAL_HANDLES`
/// entries); one more per-guest instance, indexed starting at
/// `GLOBAL_HANDLES`, serves that guest's own handles -- matching
/// `original_source/src/hcalls.c`'s shared scan-and-CAS allocator used for
/// both tables.
pub(crate) struct HandleTable {
    slots: [Option<Handle>; MAX_GUEST_HANDLES],
    /// Bitmap of occupied slots; bit `i` set means `slots[i]` is `Some`.
    /// Kept alongside `slots` so allocation can CAS on a single word per
    /// 32-slot group without taking a lock.
    occupied: [AtomicU32; MAX_GUEST_HANDLES / 32],
    base: usize,
}

impl HandleTable {
    pub(crate) fn new_global() -> Self {
        Self::new_at(0)
    }

    pub(crate) fn new_guest() -> Self {
        Self::new_at(GLOBAL_HANDLES)
    }

    fn new_at(base: usize) -> Self {
        Self {
            slots: [None; MAX_GUEST_HANDLES],
            occupied: core::array::from_fn(|_| AtomicU32::new(0)),
            base,
        }
    }

    /// Allocates the first free slot, installs `handle`, and returns its id.
    /// Returns `None` if the table is full.
    pub(crate) fn alloc(&mut self, handle: Handle) -> Option<HandleId> {
        for (group_index, group) in self.occupied.iter().enumerate() {
            let mut bits = group.load(Ordering::Relaxed);
            loop {
                let free_bit = (!bits).trailing_zeros();
                if free_bit >= 32 {
                    break;
                }
                let slot = group_index * 32 + free_bit as usize;
                if slot >= self.slots.len() {
                    break;
                }
                let new_bits = bits | (1 << free_bit);
                match group.compare_exchange_weak(
                    bits,
                    new_bits,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        self.slots[slot] = Some(handle);
                        return Some(HandleId((self.base + slot) as u32));
                    }
                    Err(observed) => bits = observed,
                }
            }
        }
        None
    }

    fn local_index(&self, id: HandleId) -> Option<usize> {
        let idx = id.0 as usize;
        idx.checked_sub(self.base).filter(|i| *i < self.slots.len())
    }

    pub(crate) fn get(&self, id: HandleId) -> Option<&Handle> {
        self.local_index(id).and_then(|i| self.slots[i].as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: HandleId) -> Option<&mut Handle> {
        self.local_index(id).and_then(move |i| self.slots[i].as_mut())
    }

    /// Frees a handle, resetting it first (the reference's "stop" path:
    /// each owned handle is reset, then released).
    pub(crate) fn free(&mut self, id: HandleId) {
        let Some(i) = self.local_index(id) else { return };
        if let Some(mut handle) = self.slots[i].take() {
            handle.reset();
        }
        let group = i / 32;
        let bit = i % 32;
        self.occupied[group].fetch_and(!(1 << bit), Ordering::AcqRel);
    }

    /// Resets every occupied handle without freeing the slots (partition
    /// stop: handles are reset but remain allocated to the same guest).
    pub(crate) fn reset_all(&mut self) {
        for slot in &mut self.slots {
            if let Some(handle) = slot {
                handle.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_table_allocates_from_zero() {
        let mut table = HandleTable::new_global();
        let id = table.alloc(Handle::ErrorQueue).unwrap();
        assert_eq!(id.0, 0);
    }

    #[test]
    fn guest_table_allocates_from_global_handles_watermark() {
        let mut table = HandleTable::new_guest();
        let id = table.alloc(Handle::ErrorQueue).unwrap();
        assert_eq!(id.0 as usize, GLOBAL_HANDLES);
    }

    #[test]
    fn alloc_never_returns_an_already_allocated_index() {
        let mut table = HandleTable::new_global();
        let a = table.alloc(Handle::ErrorQueue).unwrap();
        let b = table.alloc(Handle::ErrorQueue).unwrap();
        assert_ne!(a, b);
        table.free(a);
        let c = table.alloc(Handle::ErrorQueue).unwrap();
        assert_eq!(c, a, "freed slot should be reused before scanning further");
    }

    #[test]
    fn alloc_fails_when_table_is_full() {
        let mut table = HandleTable::new_global();
        let mut last = None;
        for _ in 0..MAX_GUEST_HANDLES {
            last = table.alloc(Handle::ErrorQueue);
        }
        assert!(last.is_some());
        assert!(table.alloc(Handle::ErrorQueue).is_none());
    }
}
</content>
