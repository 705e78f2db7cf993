//! The module containing the [`GlobalState`] type.
//!
//! Keeps the teacher's shape -- one singleton, built once at boot and
//! referenced read-only (through its own fields' interior mutability) by
//! every core thereafter -- while replacing its contents: the fuzzing
//! corpus/snapshot/patch set become the guest array, the global handle
//! table, and the PAMU engine, per SPEC_FULL.md §3.

use alloc::vec::Vec;

use spin::{Mutex, RwLock};

use crate::config::MAX_GUESTS;
use crate::devtree::{HardwareTree, HvConfigTree};
use crate::errors::{ErrorQueue, ErrorRecord, HvError};
use crate::guest::{Guest, GuestId};
use crate::handle::HandleTable;
use crate::pamu::PamuTable;

/// The singleton data structure referenced by every core. Its own fields
/// carry whatever locking each needs; `GlobalState` itself is never
/// reconstructed or resized once [`GlobalState::new`] returns.
pub(crate) struct GlobalState {
    /// One [`Guest`] per `/hv-config` `/partitions/<name>` node, indexed by
    /// `GuestId - 1` (LPID 0 is reserved for the hypervisor). Populated once
    /// at boot, before secondary cores are released, and never resized
    /// afterward -- each `Guest`'s own interior mutability is what changes
    /// at runtime.
    guests: Vec<Guest>,
    /// The hypervisor-global handle table (`HandleTable::new_global`),
    /// distinct from each guest's own per-guest table.
    global_handles: Mutex<HandleTable>,
    pamu: RwLock<PamuTable>,
    /// Error records not attributable to any single guest (SPEC_FULL.md
    /// §4.9 "the global, unattributable queue").
    global_errors: Mutex<ErrorQueue>,
    number_of_cores: u32,
}

impl GlobalState {
    /// Parses `hv_config`'s partition nodes and materializes one [`Guest`]
    /// per partition. `hw` supplies the core count used to size per-core
    /// bookkeeping elsewhere; it is not itself retained past this call.
    pub(crate) fn new(hw: &HardwareTree<'_>, hv_config: &HvConfigTree<'_>) -> Result<Self, HvError> {
        let configs = hv_config.partitions()?;
        if configs.len() > MAX_GUESTS {
            return Err(HvError::Fatal("hv-config names more partitions than MAX_GUESTS"));
        }
        let guests = configs
            .iter()
            .enumerate()
            .map(|(i, cfg)| Guest::new(GuestId((i + 1) as u32), cfg.cpus.count, cfg.cpus.base))
            .collect();
        Ok(Self {
            guests,
            global_handles: Mutex::new(HandleTable::new_global()),
            pamu: RwLock::new(PamuTable::new()),
            global_errors: Mutex::new(ErrorQueue::new()),
            number_of_cores: hw.cpu_count() as u32,
        })
    }

    /// Builds a [`GlobalState`] directly from an already-materialized guest
    /// list, bypassing device-tree parsing. Used by other modules' unit
    /// tests that need a `GlobalState` without a flattened device tree to
    /// parse.
    #[cfg(test)]
    pub(crate) fn for_test(guests: Vec<Guest>, number_of_cores: u32) -> Self {
        Self {
            guests,
            global_handles: Mutex::new(HandleTable::new_global()),
            pamu: RwLock::new(PamuTable::new()),
            global_errors: Mutex::new(ErrorQueue::new()),
            number_of_cores,
        }
    }

    pub(crate) fn guest(&self, id: GuestId) -> Option<&Guest> {
        id.0.checked_sub(1).and_then(|i| self.guests.get(i as usize))
    }

    pub(crate) fn guest_count(&self) -> u32 {
        self.guests.len() as u32
    }

    pub(crate) fn with_global_handles_mut<R>(&self, f: impl FnOnce(&mut HandleTable) -> R) -> R {
        f(&mut self.global_handles.lock())
    }

    pub(crate) fn with_pamu<R>(&self, f: impl FnOnce(&PamuTable) -> R) -> R {
        f(&self.pamu.read())
    }

    pub(crate) fn with_pamu_mut<R>(&self, f: impl FnOnce(&mut PamuTable) -> R) -> R {
        f(&mut self.pamu.write())
    }

    pub(crate) fn queue_global_error(&self, record: ErrorRecord) {
        self.global_errors.lock().push(record);
    }

    pub(crate) fn pop_global_error(&self) -> Option<ErrorRecord> {
        self.global_errors.lock().pop()
    }

    pub(crate) fn number_of_cores(&self) -> u32 {
        self.number_of_cores
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrorDomain, ErrorRecord};

    fn state() -> GlobalState {
        GlobalState::for_test(alloc::vec![Guest::new(GuestId(1), 1, 0)], 4)
    }

    fn sample_error() -> ErrorRecord {
        ErrorRecord {
            domain: ErrorDomain::EccL2 { address: 0, syndrome: 0 },
            hw_path: "l2",
            guest_path: "",
        }
    }

    #[test]
    fn guest_lookup_is_one_indexed_by_lpid() {
        let g = state();
        assert!(g.guest(GuestId(0)).is_none());
        assert!(g.guest(GuestId(1)).is_some());
        assert!(g.guest(GuestId(2)).is_none());
    }

    #[test]
    fn global_error_queue_is_fifo() {
        let g = state();
        g.queue_global_error(sample_error());
        assert!(g.pop_global_error().is_some());
        assert!(g.pop_global_error().is_none());
    }

    #[test]
    fn number_of_cores_round_trips() {
        assert_eq!(state().number_of_cores(), 4);
    }
}
