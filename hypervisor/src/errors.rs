//! The module containing [`HvError`] and the error record types it carries.
//!
//! Every fallible internal operation returns `Result<T, HvError>`. The five
//! kinds below are the only boundary conversions permitted: a trap handler
//! turns a `Reflect` into a reflected guest exception, a hypercall handler
//! turns a `Hypercall` into an ePAPR status word, `Logged`/`Queued` are
//! contained without touching guest-visible state, and `Fatal` may only be
//! matched on by the boot entry point.

use crate::config::ERROR_QUEUE_DEPTH;
use alloc::collections::VecDeque;

/// A guest-visible program/machine-check exception produced by emulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GuestException {
    /// Illegal instruction encoding or reserved-bit violation (`ESR_PIL`).
    ProgramIllegal,
    /// Privileged instruction executed from guest-user state (`ESR_PPR`).
    ProgramPrivileged,
    /// Guest referenced a GPA with no valid mapping (delivered as a machine
    /// check once the faulting access actually occurs, per the `VF` bit).
    MachineCheck,
}

/// ePAPR hypercall status codes (see SPEC_FULL.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EpaprStatus {
    Success,
    Eperm,
    Enoent,
    Eio,
    Eagain,
    Enomem,
    Efault,
    Enodev,
    Einval,
    InvalidState,
    Unimplemented,
    EbufferOverflow,
}

impl EpaprStatus {
    /// The raw ePAPR integer, per the hypercall ABI.
    pub(crate) fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Eperm => 1,
            Self::Enoent => 2,
            Self::Eio => 3,
            Self::Eagain => 4,
            Self::Enomem => 5,
            Self::Efault => 6,
            Self::Enodev => 8,
            Self::Einval => 9,
            Self::InvalidState => 10,
            Self::Unimplemented => 12,
            Self::EbufferOverflow => 14,
        }
    }
}

/// Domain-specific payload for an [`ErrorRecord`]; flattened to the fixed
/// 1024-byte wire struct only at the `err_get_info` hypercall boundary.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ErrorDomain {
    Pamu {
        avs1: u32,
        avs2: u32,
        access_violation_addr: u64,
        liodn_handle: u32,
        lpid: u32,
    },
    EccL2 {
        address: u64,
        syndrome: u32,
    },
}

/// An attributable or unattributable hardware/emulation error.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ErrorRecord {
    pub(crate) domain: ErrorDomain,
    pub(crate) hw_path: &'static str,
    pub(crate) guest_path: &'static str,
}

/// The five error kinds described in SPEC_FULL.md §7, unified so a single
/// `Result<T, HvError>` threads through emulation and hypercall code.
#[derive(Debug)]
pub(crate) enum HvError {
    /// Reflect as a guest exception.
    Reflect(GuestException),
    /// Return an ePAPR status to the hypercall caller.
    Hypercall(EpaprStatus),
    /// Log at a contained severity; no guest-visible effect.
    Logged(&'static str),
    /// Enqueue an [`ErrorRecord`] on the appropriate queue.
    Queued(ErrorRecord),
    /// Boot-time failure; the only variant the entry point may panic on.
    Fatal(&'static str),
}

/// A bounded FIFO of [`ErrorRecord`]s, one per guest plus one global queue
/// for unattributable errors.
#[derive(Debug, Default)]
pub(crate) struct ErrorQueue {
    records: VecDeque<ErrorRecord>,
}

impl ErrorQueue {
    pub(crate) fn new() -> Self {
        Self { records: VecDeque::with_capacity(ERROR_QUEUE_DEPTH) }
    }

    /// Pushes a record, dropping the oldest entry if the queue is full
    /// (matches a ring buffer; a partition that never drains its queue
    /// trades history for boundedness, not correctness).
    pub(crate) fn push(&mut self, record: ErrorRecord) {
        if self.records.len() == ERROR_QUEUE_DEPTH {
            let _ = self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub(crate) fn pop(&mut self) -> Option<ErrorRecord> {
        self.records.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_drops_oldest_when_full() {
        let mut q = ErrorQueue::new();
        for i in 0..ERROR_QUEUE_DEPTH + 3 {
            q.push(ErrorRecord {
                domain: ErrorDomain::EccL2 { address: i as u64, syndrome: 0 },
                hw_path: "l2",
                guest_path: "",
            });
        }
        assert_eq!(q.len(), ERROR_QUEUE_DEPTH);
        let first = q.pop().unwrap();
        match first.domain {
            ErrorDomain::EccL2 { address, .. } => assert_eq!(address, 3),
            ErrorDomain::Pamu { .. } => panic!("wrong variant"),
        }
    }
}
</content>
