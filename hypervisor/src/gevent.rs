//! The cross-vCPU event bus ("gevents"), SPEC_FULL.md §4.7.
//!
//! An event is a single bit in either the normal or critical pending mask
//! of a target vCPU; posting is an atomic OR followed by an IPI to the
//! target's physical core. Grounded on the doorbell-driven notification
//! pattern in `original_source/src/emulate.c::emu_msgsnd`/`tlbivax_ipi`,
//! generalized into a typed bitmask rather than a single doorbell bit.

use core::sync::atomic::{AtomicU32, Ordering};

/// The defined gevent kinds, in dispatch-table order -- events of the same
/// priority class are delivered in this order, not submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum GeventKind {
    Start = 0,
    StartWait = 1,
    Stop = 2,
    Tlbivax = 3,
    Nmi = 4,
    Gdb = 5,
    /// A normal-priority `msgsnd`/`DBELL` doorbell, SPEC_FULL.md §4.6.
    /// Distinct from `Start`/`StartWait` (SPEC_FULL.md §4.7/§4.8): a
    /// doorbell carries no partition-lifecycle meaning of its own.
    DoorbellNormal = 6,
}

const GEVENT_COUNT: u32 = 7;

impl GeventKind {
    fn bit(self) -> u32 {
        1 << (self as u32)
    }

    const ALL_IN_ORDER: [Self; GEVENT_COUNT as usize] = [
        Self::Start,
        Self::StartWait,
        Self::Stop,
        Self::Tlbivax,
        Self::Nmi,
        Self::Gdb,
        Self::DoorbellNormal,
    ];

    /// Whether this event is delivered on the critical-priority path.
    fn is_critical(self) -> bool {
        matches!(self, Self::Nmi | Self::Gdb)
    }
}

/// Per-vCPU pending-event state: one bitmask for normal-priority events,
/// one for critical-priority events.
#[derive(Debug, Default)]
pub(crate) struct GeventMask {
    normal: AtomicU32,
    critical: AtomicU32,
}

impl GeventMask {
    pub(crate) fn new() -> Self {
        Self { normal: AtomicU32::new(0), critical: AtomicU32::new(0) }
    }

    /// Posts an event: atomic OR into the matching mask. The IPI to the
    /// target's physical core is the caller's responsibility (it owns the
    /// core-to-vCPU mapping); this only updates the pending bits.
    pub(crate) fn post(&self, kind: GeventKind) {
        let mask = if kind.is_critical() { &self.critical } else { &self.normal };
        mask.fetch_or(kind.bit(), Ordering::AcqRel);
    }

    /// Takes and clears the next pending event in dispatch-table order,
    /// critical events ahead of normal events (critical events are, by
    /// definition, meant to preempt).
    pub(crate) fn take_next(&self) -> Option<GeventKind> {
        if let Some(kind) = Self::take_from(&self.critical) {
            return Some(kind);
        }
        Self::take_from(&self.normal)
    }

    fn take_from(mask: &AtomicU32) -> Option<GeventKind> {
        let mut current = mask.load(Ordering::Acquire);
        loop {
            let found = GeventKind::ALL_IN_ORDER.into_iter().find(|k| (current & k.bit()) != 0)?;
            let new = current & !found.bit();
            match mask.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(found),
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.normal.load(Ordering::Acquire) != 0 || self.critical.load(Ordering::Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_then_take_round_trips() {
        let mask = GeventMask::new();
        mask.post(GeventKind::Stop);
        assert_eq!(mask.take_next(), Some(GeventKind::Stop));
        assert_eq!(mask.take_next(), None);
    }

    #[test]
    fn events_delivered_in_dispatch_table_order_not_submission_order() {
        let mask = GeventMask::new();
        mask.post(GeventKind::Stop);
        mask.post(GeventKind::Start);
        // Start precedes Stop in ALL_IN_ORDER despite being posted second.
        assert_eq!(mask.take_next(), Some(GeventKind::Start));
        assert_eq!(mask.take_next(), Some(GeventKind::Stop));
    }

    #[test]
    fn critical_events_are_drained_ahead_of_normal_events() {
        let mask = GeventMask::new();
        mask.post(GeventKind::Start);
        mask.post(GeventKind::Nmi);
        assert_eq!(mask.take_next(), Some(GeventKind::Nmi));
        assert_eq!(mask.take_next(), Some(GeventKind::Start));
    }

    #[test]
    fn has_pending_reflects_both_masks() {
        let mask = GeventMask::new();
        assert!(!mask.has_pending());
        mask.post(GeventKind::Gdb);
        assert!(mask.has_pending());
        let _ = mask.take_next();
        assert!(!mask.has_pending());
    }
}
</content>
