//! A partition ("guest") and its lifecycle state machine, SPEC_FULL.md §3
//! and §4.8.
//!
//! Grounded on `original_source/src/guest.c`'s `stop_guest`/`start_guest`/
//! `do_stop_core` (the umbrella `guest_starting`/`guest_stopping` states
//! collapse the internal "waiting for image load"/"waiting for all vCPUs to
//! stop" substates, exactly as `hcall_partition_get_status` does before
//! returning a status code) and its `tlbivax_addr`/`tlbivax_count`
//! broadcast fields (`emulate.c::emu_tlbivax`/`tlbivax_ipi`); the
//! device/handle/error-queue ownership shape is reconstructed from
//! `original_source/include/handle.h` and the data model in SPEC_FULL.md
//! §3.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use spin::{Mutex, RwLock};

use crate::config::MAX_GUESTS;
use crate::errors::ErrorQueue;
use crate::gphys::{GphysMap, ReverseGphys};
use crate::handle::HandleTable;
use crate::vcpu::Vcpu;

/// Identifies one guest among the `1..=MAX_GUESTS` logical partition IDs
/// (LPID 0 is reserved for the hypervisor itself, matching hardware's own
/// LPID semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct GuestId(pub(crate) u32);

/// The publicly visible partition lifecycle states, per SPEC_FULL.md §4.8.
/// Internal substates ("waiting for image load", "waiting for all vCPUs to
/// stop") are folded into `Starting`/`Stopping` here, exactly as the
/// reference collapses them before returning a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GuestState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl GuestState {
    /// The integer code `hcall_partition_get_status` returns, per
    /// SPEC_FULL.md §6 "Partition status codes".
    pub(crate) fn status_code(self) -> u32 {
        match self {
            Self::Stopped => 0,
            Self::Running => 1,
            Self::Starting => 2,
            Self::Stopping => 3,
        }
    }
}

/// A transition the lifecycle state machine refused because the guest was
/// not in a state that permits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InvalidTransition {
    pub(crate) from: GuestState,
}

/// Identifies a device this guest owns, for reassignment bookkeeping on
/// restart/claim (SPEC_FULL.md §4.10 "On a claim").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OwnedLiodn(pub(crate) u32);

struct GuestInner {
    state: GuestState,
    gphys: GphysMap,
    reverse_gphys: ReverseGphys,
    handles: HandleTable,
    owned_liodns: Vec<OwnedLiodn>,
    errors: ErrorQueue,
}

/// A partition: LPID, its vCPUs, and the state protected by its lifecycle
/// lock. Per SPEC_FULL.md §5, the guest's mutable state sits behind a
/// `spin::Mutex`/`RwLock` split matching the single-writer/many-reader
/// shape of each field (GPhys map readers never lock; lifecycle state does
/// because the requester, not the vCPU, drives the transition).
pub(crate) struct Guest {
    pub(crate) id: GuestId,
    vcpus: Vec<Vcpu>,
    inner: RwLock<GuestInner>,
    /// Count of vCPUs still to acknowledge the `STOP` gevent drain. Paired
    /// with a lock only at the point a new stop is issued; acknowledgement
    /// is a lock-free decrement.
    stop_pending: AtomicU32,
    stop_lock: Mutex<()>,
    /// Set by `hcall_partition_restart` before it posts `Stop`: the last
    /// vCPU to acknowledge moves the guest to `Starting` (and the caller
    /// must post `StartWait` to vCPU 0) instead of `Stopped`.
    restart_requested: AtomicBool,
    /// `tlbivax` cross-core synchronization: the issuer's serialization
    /// lock and outstanding-acknowledgement counter (SPEC_FULL.md §3 "Guest"
    /// / §4.4).
    tlbivax_lock: Mutex<()>,
    tlbivax_pending: AtomicU32,
    /// The effective address published by the current `tlbivax` issuer
    /// (`original_source/src/emulate.c::emu_tlbivax` sets `guest->tlbivax_addr`
    /// under the same serialization lock before posting the broadcast;
    /// `tlbivax_ipi` reads it back on each target core).
    tlbivax_ea: AtomicU64,
}

impl Guest {
    pub(crate) fn new(id: GuestId, vcpu_count: u32, first_core: u32) -> Self {
        assert!(id.0 >= 1 && (id.0 as usize) <= MAX_GUESTS, "LPID out of range");
        let vcpus = (0..vcpu_count).map(|i| Vcpu::new(i, first_core + i)).collect();
        Self {
            id,
            vcpus,
            inner: RwLock::new(GuestInner {
                state: GuestState::Stopped,
                gphys: GphysMap::new(),
                reverse_gphys: ReverseGphys::new(),
                handles: HandleTable::new_guest(),
                owned_liodns: Vec::new(),
                errors: ErrorQueue::new(),
            }),
            stop_pending: AtomicU32::new(0),
            stop_lock: Mutex::new(()),
            restart_requested: AtomicBool::new(false),
            tlbivax_lock: Mutex::new(()),
            tlbivax_pending: AtomicU32::new(0),
            tlbivax_ea: AtomicU64::new(0),
        }
    }

    pub(crate) fn vcpu_count(&self) -> u32 {
        self.vcpus.len() as u32
    }

    pub(crate) fn vcpu(&self, index: u32) -> Option<&Vcpu> {
        self.vcpus.get(index as usize)
    }

    pub(crate) fn state(&self) -> GuestState {
        self.inner.read().state
    }

    pub(crate) fn with_gphys<R>(&self, f: impl FnOnce(&GphysMap) -> R) -> R {
        f(&self.inner.read().gphys)
    }

    pub(crate) fn with_gphys_mut<R>(&self, f: impl FnOnce(&mut GphysMap) -> R) -> R {
        f(&mut self.inner.write().gphys)
    }

    pub(crate) fn with_reverse_gphys_mut<R>(&self, f: impl FnOnce(&mut ReverseGphys) -> R) -> R {
        f(&mut self.inner.write().reverse_gphys)
    }

    pub(crate) fn with_handles_mut<R>(&self, f: impl FnOnce(&mut HandleTable) -> R) -> R {
        f(&mut self.inner.write().handles)
    }

    pub(crate) fn queue_error(&self, record: crate::errors::ErrorRecord) {
        self.inner.write().errors.push(record);
    }

    /// Begins a `Stopped → Starting` transition. The caller is responsible
    /// for then posting the `Start`/`StartWait` gevent and, on primary-vCPU
    /// acknowledgement, calling [`Guest::finish_starting`].
    pub(crate) fn begin_start(&self) -> Result<(), InvalidTransition> {
        let mut inner = self.inner.write();
        if inner.state != GuestState::Stopped {
            return Err(InvalidTransition { from: inner.state });
        }
        inner.state = GuestState::Starting;
        Ok(())
    }

    pub(crate) fn finish_starting(&self) {
        let mut inner = self.inner.write();
        debug_assert_eq!(inner.state, GuestState::Starting);
        inner.state = GuestState::Running;
    }

    /// Begins a `Running → Stopping` transition and arms the synchronous
    /// `STOP` acknowledgement counter at the guest's current vCPU count.
    /// `restart` mirrors `original_source/src/guest.c::do_stop_core`'s
    /// `restart` argument: when set, the last acknowledgement moves the
    /// guest to `Starting` instead of `Stopped` (SPEC_FULL.md §4.8
    /// "Restart").
    pub(crate) fn begin_stop(&self, restart: bool) -> Result<(), InvalidTransition> {
        let _guard = self.stop_lock.lock();
        let mut inner = self.inner.write();
        if inner.state != GuestState::Running {
            return Err(InvalidTransition { from: inner.state });
        }
        inner.state = GuestState::Stopping;
        self.restart_requested.store(restart, Ordering::Release);
        self.stop_pending.store(self.vcpu_count(), Ordering::Release);
        Ok(())
    }

    /// Called once per vCPU after it has reset its owned handles and MPIC
    /// state in response to the `STOP` gevent. When the last vCPU
    /// acknowledges, resets the handle table and moves the guest to
    /// `Stopped` -- or, if this stop was raised by `hcall_partition_restart`,
    /// to `Starting`. Returns `true` in the latter case, telling the caller
    /// to post `StartWait` to vCPU 0 (mirrors `do_stop_core`'s
    /// `setgevent(guest->gcpus[0], GEV_START_WAIT)`).
    pub(crate) fn acknowledge_stop(&self) -> bool {
        if self.stop_pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut inner = self.inner.write();
            inner.handles.reset_all();
            if self.restart_requested.swap(false, Ordering::AcqRel) {
                inner.state = GuestState::Starting;
                return true;
            }
            inner.state = GuestState::Stopped;
        }
        false
    }

    /// Serializes one `tlbivax` broadcast: only one issuer on this guest
    /// may be mid-protocol at a time (SPEC_FULL.md §4.4 "one issuer at a
    /// time, serialized by the guest's `sync_ipi_lock`"). Publishes `ea`
    /// (matching `emu_tlbivax`'s `guest->tlbivax_addr = va`, set under the
    /// same lock before the broadcast goes out) so every target vCPU can
    /// read back the address it must invalidate.
    pub(crate) fn begin_tlbivax(&self, waiters: u32, ea: u64) -> TlbivaxGuard<'_> {
        let guard = self.tlbivax_lock.lock();
        self.tlbivax_ea.store(ea, Ordering::Release);
        self.tlbivax_pending.store(waiters, Ordering::Release);
        TlbivaxGuard { _lock: guard, guest: self }
    }

    /// The effective address published by the in-flight `tlbivax`
    /// broadcast, read by a target vCPU servicing the `Tlbivax` gevent.
    pub(crate) fn tlbivax_ea(&self) -> u64 {
        self.tlbivax_ea.load(Ordering::Acquire)
    }

    /// Called by a target vCPU once it has performed the local invalidation
    /// in response to a `TLBIVAX` gevent.
    pub(crate) fn acknowledge_tlbivax(&self) {
        self.tlbivax_pending.fetch_sub(1, Ordering::AcqRel);
    }

    fn tlbivax_remaining(&self) -> u32 {
        self.tlbivax_pending.load(Ordering::Acquire)
    }

    pub(crate) fn owned_liodns(&self) -> Vec<OwnedLiodn> {
        self.inner.read().owned_liodns.clone()
    }

    pub(crate) fn claim_liodn(&self, liodn: OwnedLiodn) {
        self.inner.write().owned_liodns.push(liodn);
    }

    pub(crate) fn release_liodn(&self, liodn: OwnedLiodn) {
        self.inner.write().owned_liodns.retain(|l| *l != liodn);
    }
}

/// Held by a `tlbivax` issuer for the duration of one broadcast; dropping
/// it releases the guest's serialization lock to the next issuer.
/// [`TlbivaxGuard::wait`] spins until every targeted vCPU has acknowledged,
/// per SPEC_FULL.md §4.4 step 5.
#[must_use]
pub(crate) struct TlbivaxGuard<'a> {
    _lock: spin::MutexGuard<'a, ()>,
    guest: &'a Guest,
}

impl TlbivaxGuard<'_> {
    pub(crate) fn wait(&self) {
        while self.guest.tlbivax_remaining() != 0 {
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stopped_guest() -> Guest {
        Guest::new(GuestId(1), 2, 0)
    }

    #[test]
    fn new_guest_starts_stopped() {
        let g = stopped_guest();
        assert_eq!(g.state(), GuestState::Stopped);
    }

    #[test]
    fn start_then_stop_then_start_returns_to_running() {
        let g = stopped_guest();
        g.begin_start().unwrap();
        g.finish_starting();
        assert_eq!(g.state(), GuestState::Running);

        g.begin_stop(false).unwrap();
        assert_eq!(g.state(), GuestState::Stopping);
        for _ in 0..g.vcpu_count() {
            g.acknowledge_stop();
        }
        assert_eq!(g.state(), GuestState::Stopped);

        g.begin_start().unwrap();
        g.finish_starting();
        assert_eq!(g.state(), GuestState::Running);
    }

    #[test]
    fn stop_partway_through_acknowledgement_stays_stopping() {
        let g = stopped_guest();
        g.begin_start().unwrap();
        g.finish_starting();
        g.begin_stop(false).unwrap();
        g.acknowledge_stop();
        assert_eq!(g.state(), GuestState::Stopping, "not all vCPUs acked yet");
    }

    #[test]
    fn restart_stop_moves_to_starting_once_every_vcpu_acks() {
        let g = stopped_guest();
        g.begin_start().unwrap();
        g.finish_starting();
        g.begin_stop(true).unwrap();
        assert!(!g.acknowledge_stop());
        assert!(g.acknowledge_stop());
        assert_eq!(g.state(), GuestState::Starting);
    }

    #[test]
    fn tlbivax_wait_returns_once_all_waiters_acknowledge() {
        let g = stopped_guest();
        let guard = g.begin_tlbivax(2, 0x2000);
        assert_eq!(g.tlbivax_ea(), 0x2000);
        g.acknowledge_tlbivax();
        g.acknowledge_tlbivax();
        guard.wait();
        assert_eq!(g.tlbivax_remaining(), 0);
    }

    #[test]
    fn starting_a_running_guest_is_rejected() {
        let g = stopped_guest();
        g.begin_start().unwrap();
        g.finish_starting();
        assert_eq!(g.begin_start(), Err(InvalidTransition { from: GuestState::Running }));
    }

    #[test]
    fn status_codes_match_the_documented_wire_values() {
        assert_eq!(GuestState::Stopped.status_code(), 0);
        assert_eq!(GuestState::Running.status_code(), 1);
        assert_eq!(GuestState::Starting.status_code(), 2);
        assert_eq!(GuestState::Stopping.status_code(), 3);
    }

    #[test]
    fn claim_then_release_liodn_round_trips() {
        let g = stopped_guest();
        g.claim_liodn(OwnedLiodn(7));
        assert_eq!(g.owned_liodns(), alloc::vec![OwnedLiodn(7)]);
        g.release_liodn(OwnedLiodn(7));
        assert!(g.owned_liodns().is_empty());
    }
}
</content>
