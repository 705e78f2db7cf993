//! Guest performance-monitor register emulation, SPEC_FULL.md §4.5.
//!
//! `PMC0..PMC3` and their `PMLCa`/`PMLCb`/`PMGC0` control registers are all
//! Per-vCPU: the hypervisor holds the values, and a write additionally runs
//! the perfmon-workaround post-check against `MSRP` (SPEC_FULL.md §4.5,
//! `original_source/src/gspr.c`).

use crate::config::NUM_PERF_CTRS;
use crate::spr::{self, SprId};
use crate::vcpu::Vcpu;

/// Identifies which performance-monitor register a guest `mfpmr`/`mtpmr`
/// targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PmrId {
    Pmc(u8),
    Pmlca(u8),
    Pmlcb(u8),
    Pmgc0,
}

/// `MSRP`'s perfmon-workaround bit: set when the workaround is armed,
/// cleared once the guest has masked the counter's overflow interrupt
/// source (the post-check below).
const MSRP_PMM_WORKAROUND: u64 = 1 << 0;
/// `PMLCa`'s interrupt-enable bit (`CE`); clearing it disengages the
/// workaround.
const PMLCA_CE: u32 = 1 << 31;

pub(crate) fn read(vcpu: &Vcpu, id: PmrId) -> u32 {
    match id {
        PmrId::Pmc(n) => ctr(vcpu, n).copied().unwrap_or(0),
        PmrId::Pmlca(n) => vcpu.perfmon.pmlca.get(n as usize).copied().unwrap_or(0),
        PmrId::Pmlcb(n) => vcpu.perfmon.pmlcb.get(n as usize).copied().unwrap_or(0),
        PmrId::Pmgc0 => vcpu.perfmon.pmgc0,
    }
}

fn ctr(vcpu: &Vcpu, n: u8) -> Option<&u32> {
    vcpu.perfmon.pmc.get(n as usize)
}

/// Writes `value` to `id`, then runs the perfmon-workaround post-check: if
/// the write was to a `PMLCa` register and it cleared `CE`, and `MSRP`'s
/// workaround bit was set, clear it.
pub(crate) fn write(vcpu: &mut Vcpu, id: PmrId, value: u32) {
    match id {
        PmrId::Pmc(n) => set(&mut vcpu.perfmon.pmc, n, value),
        PmrId::Pmlca(n) => {
            set(&mut vcpu.perfmon.pmlca, n, value);
            if value & PMLCA_CE == 0 {
                let masked_msrp = spr::read_gspr(vcpu, SprId::Msrp) & !MSRP_PMM_WORKAROUND;
                spr::write_gspr(vcpu, SprId::Msrp, masked_msrp);
            }
        }
        PmrId::Pmlcb(n) => set(&mut vcpu.perfmon.pmlcb, n, value),
        PmrId::Pmgc0 => vcpu.perfmon.pmgc0 = value,
    }
}

fn set(slots: &mut [u32; NUM_PERF_CTRS], n: u8, value: u32) {
    if let Some(slot) = slots.get_mut(n as usize) {
        *slot = value;
    }
}

/// Maps the architectural PMR number a trapped `mfpmr`/`mtpmr` instruction
/// encodes to the register this registry tracks. Covers all `NUM_PERF_CTRS`
/// counters' `PMLCa`/`PMLCb` pairs (`original_source/src/gspr.c:898-932`
/// virtualizes `PMR_PMLCA0..PMLCA3`/`PMR_PMLCB0..PMLCB3`, one case per
/// counter), not just counter 0's.
pub(crate) fn from_guest_number(n: u16) -> Option<PmrId> {
    Some(match n {
        16..=19 => PmrId::Pmc((n - 16) as u8),
        144..=147 => PmrId::Pmlca((n - 144) as u8),
        272..=275 => PmrId::Pmlcb((n - 272) as u8),
        400 => PmrId::Pmgc0,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pmc_write_then_read_round_trips() {
        let mut vcpu = Vcpu::new(0, 0);
        write(&mut vcpu, PmrId::Pmc(2), 0xabcd);
        assert_eq!(read(&vcpu, PmrId::Pmc(2)), 0xabcd);
    }

    #[test]
    fn pmc_write_out_of_range_counter_is_ignored() {
        let mut vcpu = Vcpu::new(0, 0);
        write(&mut vcpu, PmrId::Pmc(200), 1);
        assert_eq!(read(&vcpu, PmrId::Pmc(200)), 0);
    }

    #[test]
    fn clearing_pmlca_ce_disengages_msrp_workaround() {
        let mut vcpu = Vcpu::new(0, 0);
        vcpu.sprs.msrp = MSRP_PMM_WORKAROUND;
        write(&mut vcpu, PmrId::Pmlca(0), 0);
        assert_eq!(vcpu.sprs.msrp & MSRP_PMM_WORKAROUND, 0);
    }

    #[test]
    fn setting_pmlca_ce_leaves_msrp_workaround_untouched() {
        let mut vcpu = Vcpu::new(0, 0);
        vcpu.sprs.msrp = MSRP_PMM_WORKAROUND;
        write(&mut vcpu, PmrId::Pmlca(0), PMLCA_CE);
        assert_eq!(vcpu.sprs.msrp & MSRP_PMM_WORKAROUND, MSRP_PMM_WORKAROUND);
    }

    #[test]
    fn guest_numbers_resolve_to_the_expected_register() {
        assert_eq!(from_guest_number(16), Some(PmrId::Pmc(0)));
        assert_eq!(from_guest_number(19), Some(PmrId::Pmc(3)));
        assert_eq!(from_guest_number(400), Some(PmrId::Pmgc0));
        assert_eq!(from_guest_number(1), None);
    }

    #[test]
    fn all_four_counters_pmlca_and_pmlcb_are_mapped() {
        for n in 0..NUM_PERF_CTRS as u16 {
            assert_eq!(from_guest_number(144 + n), Some(PmrId::Pmlca(n as u8)));
            assert_eq!(from_guest_number(272 + n), Some(PmrId::Pmlcb(n as u8)));
        }
    }
}
</content>
