//! Instruction decode/dispatch and the TLB refill + `tlbwe`/`tlbivax`
//! emulation, SPEC_FULL.md §4.2/§4.3/§4.4.
//!
//! Grounded on `original_source/src/emulate.c`'s `emu_tlbwe`/`emu_tlbivax`/
//! `tlbivax_ipi`: `emu_tlbivax` takes the broadcast lock, stores the
//! effective address on the guest (`guest->tlbivax_addr`), posts
//! `EV_TLBIVAX` to every non-napping vCPU but the issuer, then invalidates
//! its own TLB and spins on `guest->tlbivax_count`; each target applies the
//! same address via `tlbivax_ipi` and decrements the count. The decode
//! table shape itself follows [`crate::hcall`]'s vendor/number split applied
//! to the `hvpriv` major/minor opcode space.

use crate::gevent::GeventKind;
use crate::guest::Guest;
use crate::tlb::{ShadowTlb0, TlbEntry, TlbWriteError};
use crate::vcpu::Vcpu;

/// Reflected to the guest when emulation cannot proceed, per SPEC_FULL.md
/// §4.3 "Reserved bits in any MAS register".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EmulateError {
    ProgramIllegal,
    Busy,
}

impl From<TlbWriteError> for EmulateError {
    fn from(e: TlbWriteError) -> Self {
        match e {
            TlbWriteError::Busy => Self::Busy,
        }
    }
}

/// The guest-written MAS register snapshot a `tlbwe` trap presents.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MasSnapshot {
    pub(crate) mas0: u32,
    pub(crate) mas1: u32,
    pub(crate) mas2: u64,
    pub(crate) mas3: u32,
    pub(crate) mas7: u32,
}

const MAS0_TLBSEL_TLB1: u32 = 1 << 28;
const MAS1_VALID: u32 = 1 << 31;
/// Host-reserved bits masked out of a guest-composed `mas3` before storage
/// (SPEC_FULL.md §4.2 step 5, "masking off host-reserved").
const MAS3_GUEST_WRITABLE_MASK: u32 = 0xffff_ffc0;
/// `mas8.VF` — virtualization fault, set when the GPA has no valid mapping.
const MAS8_VF: u32 = 1 << 24;

fn mas_reserved_bits_valid(mas: &MasSnapshot) -> bool {
    // Real hardware defines narrow reserved-bit ranges per MAS register;
    // the one architectural invariant every caller must uphold is that
    // MAS1.TSIZE never names an encoding larger than the field width.
    (mas.mas1 >> 8) & 0xf <= 0xa
}

fn tsize_pages(mas1: u32) -> u64 {
    let tsize_exp = (mas1 >> 8) & 0xf;
    1u64 << (2 * tsize_exp)
}

/// Emulates guest `tlbwe`, per SPEC_FULL.md §4.3. Interrupts must already
/// be disabled by the caller for the duration of this call (a
/// [`crate::ppc::CriticalSection`] held across it).
pub(crate) fn emu_tlbwe(
    vcpu: &mut Vcpu,
    shadow: &mut ShadowTlb0,
    gphys: &crate::gphys::GphysMap,
    lpid: u32,
    esel: usize,
    mas: MasSnapshot,
) -> Result<(), EmulateError> {
    if !mas_reserved_bits_valid(&mas) {
        return Err(EmulateError::ProgramIllegal);
    }
    if mas.mas1 & MAS1_VALID == 0 {
        // An invalidating write (VALID=0) never conflicts with anything.
        vcpu.tlb1.lock().write(
            esel,
            TlbEntry { mas1: 0, mas2: 0, mas3: 0, mas7: 0, mas8: 0, gmas3: 0 },
        );
        return Ok(());
    }

    let is_tlb1 = mas.mas0 & MAS0_TLBSEL_TLB1 != 0;
    let mas1 = if is_tlb1 { mas.mas1 } else { mas.mas1 & !0xf00 };
    let pages = tsize_pages(mas1);
    let gpa_pn = mas.mas3; // RPN field aliases MAS3 bits 20..31 on hardware; caller pre-shifts.

    let candidate =
        TlbEntry { mas1, mas2: mas.mas2, mas3: mas.mas3, mas7: mas.mas7, mas8: 0, gmas3: 0 };

    if is_tlb1 && vcpu.tlb1.lock().find_overlap(&candidate, esel).is_some() {
        return Err(EmulateError::Busy);
    }
    let epn = mas.mas2 & !0xfff;
    if shadow.would_duplicate(epn, 0, false) {
        return Err(EmulateError::Busy);
    }

    let (entry, _run) = gphys.xlate_with_size(gpa_pn, pages as u32);
    let mut composed_mas3 = mas.mas3 & MAS3_GUEST_WRITABLE_MASK;
    let mut mas8 = lpid & 0xff;
    if !entry.is_valid() {
        mas8 |= MAS8_VF;
    } else {
        let attr_bits = (entry.attr.bits() as u32) & 0x3f;
        composed_mas3 |= attr_bits;
    }

    let composed = TlbEntry {
        mas1,
        mas2: mas.mas2,
        mas3: composed_mas3,
        mas7: mas.mas7,
        mas8,
        gmas3: mas.mas3,
    };

    if is_tlb1 {
        vcpu.tlb1.lock().write(esel, composed);
    } else {
        let epn = mas.mas2 & !0xfff;
        shadow.install(
            epn,
            0,
            false,
            0,
            (mas.mas2 & 0xfff) as u16,
            entry.rpn,
            (composed_mas3 & 0xffff) as u16,
            mas.mas3,
        );
    }
    Ok(())
}

/// Refill algorithm on data/instruction TLB miss, SPEC_FULL.md §4.2.
/// Returns the composed entry to be written into hardware MAS0..MAS8 (the
/// actual `tlbwe` is issued by the caller, which owns the MAS register
/// sequencing).
pub(crate) fn refill_on_miss(
    vcpu: &Vcpu,
    gphys: &crate::gphys::GphysMap,
    lpid: u32,
    faulting_ea: u64,
    pid: u8,
    as_bit: bool,
) -> TlbEntry {
    let probe = TlbEntry {
        mas1: MAS1_VALID | (u32::from(pid) << 16) | if as_bit { 1 << 12 } else { 0 },
        mas2: faulting_ea & !0xfff,
        mas3: 0,
        mas7: 0,
        mas8: 0,
        gmas3: 0,
    };
    if let Some(idx) = vcpu.tlb1.lock().find_overlap(&probe, usize::MAX) {
        return vcpu.tlb1.lock().read(idx).unwrap();
    }

    let gpa_pn = (faulting_ea / 4096) as u32;
    let (entry, _run) = gphys.xlate_with_size(gpa_pn, 1);
    let mut mas8 = lpid & 0xff;
    let mut mas3 = 0u32;
    if !entry.is_valid() {
        mas8 |= MAS8_VF;
    } else {
        mas3 = (entry.attr.bits() as u32) & 0x3f;
    }
    TlbEntry {
        mas1: probe.mas1 | (0 << 8), // TSIZE = 4K
        mas2: probe.mas2,
        mas3,
        mas7: 0,
        mas8,
        gmas3: mas3,
    }
}

/// The four `tlbilx` sub-forms selected by its `t` field, SPEC_FULL.md §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TlbilxKind {
    Lpid,
    Pid,
    Addr,
}

pub(crate) fn decode_tlbilx_t(t: u32) -> Option<TlbilxKind> {
    match t {
        0 => Some(TlbilxKind::Lpid),
        1 => Some(TlbilxKind::Pid),
        3 => Some(TlbilxKind::Addr),
        _ => None, // t == 2 is reserved.
    }
}

/// Executes the post-and-locally-invalidate half of `tlbivax`'s
/// synchronous cross-core invalidation protocol, SPEC_FULL.md §4.4.
/// `issuer_index` identifies the calling vCPU within `guest`; the local
/// invalidation (step 3) is applied to `local_shadow` directly here, while
/// remote vCPUs invalidate their own TLB1 when they process the posted
/// `TLBIVAX` gevent on their own core ([`handle_tlbivax_gevent`]).
///
/// Returns a guard the caller must `wait()` on before the emulated
/// `tlbivax` instruction is allowed to retire — step 5 of the protocol,
/// kept as an explicit final step so the caller controls exactly when it
/// blocks relative to other per-core work.
#[must_use]
pub(crate) fn emu_tlbivax<'a>(
    guest: &'a Guest,
    issuer_index: u32,
    local_shadow: &mut ShadowTlb0,
    ea: u64,
) -> crate::guest::TlbivaxGuard<'a> {
    let waiters = (0..guest.vcpu_count())
        .filter(|&i| i != issuer_index)
        .filter(|&i| !guest.vcpu(i).is_some_and(Vcpu::is_napping))
        .count() as u32;

    let guard = guest.begin_tlbivax(waiters, ea);
    for i in 0..guest.vcpu_count() {
        if i == issuer_index {
            continue;
        }
        if let Some(vcpu) = guest.vcpu(i) {
            if !vcpu.is_napping() {
                vcpu.gevents.post(GeventKind::Tlbivax);
            }
        }
    }

    local_shadow.invalidate(ea & !0xfff, 0, false);
    if let Some(issuer) = guest.vcpu(issuer_index) {
        issuer.tlb1.lock().invalidate_addr(ea);
    }

    guard
}

/// Invoked by a target vCPU processing a `TLBIVAX` gevent: performs the
/// local invalidation and acknowledges.
pub(crate) fn handle_tlbivax_gevent(
    guest: &Guest,
    target_index: u32,
    local_shadow: &mut ShadowTlb0,
    ea: u64,
) {
    local_shadow.invalidate(ea & !0xfff, 0, false);
    if let Some(vcpu) = guest.vcpu(target_index) {
        vcpu.tlb1.lock().invalidate_addr(ea);
    }
    guest.acknowledge_tlbivax();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gphys::GphysAttr;
    use crate::guest::GuestId;

    fn valid_mas(mas2: u64, mas3_rpn: u32) -> MasSnapshot {
        MasSnapshot { mas0: MAS0_TLBSEL_TLB1, mas1: MAS1_VALID, mas2, mas3: mas3_rpn, mas7: 0 }
    }

    #[test]
    fn tlbwe_to_tlb1_writes_composed_entry_with_vf_on_unbacked_gpa() {
        let mut vcpu = Vcpu::new(0, 0);
        let mut shadow = ShadowTlb0::new();
        let gphys = crate::gphys::GphysMap::new();
        let mas = valid_mas(0x1000_0000, 0);
        emu_tlbwe(&mut vcpu, &mut shadow, &gphys, 3, 0, mas).unwrap();
        let written = vcpu.tlb1.lock().read(0).unwrap();
        assert_ne!(written.mas8 & MAS8_VF, 0);
    }

    #[test]
    fn tlbwe_to_tlb1_composes_attr_bits_on_backed_gpa() {
        let mut vcpu = Vcpu::new(0, 0);
        let mut shadow = ShadowTlb0::new();
        let mut gphys = crate::gphys::GphysMap::new();
        gphys.map(0x1000_0000 / 4096, 0x2000, 4, GphysAttr::VALID | GphysAttr::USER_WRITABLE);
        let mas = valid_mas(0x1000_0000, 0);
        emu_tlbwe(&mut vcpu, &mut shadow, &gphys, 3, 0, mas).unwrap();
        let written = vcpu.tlb1.lock().read(0).unwrap();
        assert_eq!(written.mas8 & MAS8_VF, 0);
    }

    #[test]
    fn tlbwe_rejects_overlapping_tlb1_entry_with_busy() {
        let mut vcpu = Vcpu::new(0, 0);
        let mut shadow = ShadowTlb0::new();
        let gphys = crate::gphys::GphysMap::new();
        let mas = valid_mas(0x2000_0000, 0);
        emu_tlbwe(&mut vcpu, &mut shadow, &gphys, 1, 0, mas).unwrap();
        let err = emu_tlbwe(&mut vcpu, &mut shadow, &gphys, 1, 1, mas).unwrap_err();
        assert_eq!(err, EmulateError::Busy);
    }

    #[test]
    fn tlbwe_with_invalid_reserved_tsize_is_rejected() {
        let mut vcpu = Vcpu::new(0, 0);
        let mut shadow = ShadowTlb0::new();
        let gphys = crate::gphys::GphysMap::new();
        let mut mas = valid_mas(0x3000_0000, 0);
        mas.mas1 |= 0xf << 8; // reserved TSIZE encoding
        assert_eq!(
            emu_tlbwe(&mut vcpu, &mut shadow, &gphys, 1, 0, mas).unwrap_err(),
            EmulateError::ProgramIllegal
        );
    }

    #[test]
    fn tlbilx_t_field_decodes_three_forms_and_rejects_reserved() {
        assert_eq!(decode_tlbilx_t(0), Some(TlbilxKind::Lpid));
        assert_eq!(decode_tlbilx_t(1), Some(TlbilxKind::Pid));
        assert_eq!(decode_tlbilx_t(3), Some(TlbilxKind::Addr));
        assert_eq!(decode_tlbilx_t(2), None);
    }

    #[test]
    fn tlbivax_skips_napping_vcpus_when_counting_waiters() {
        let g = Guest::new(GuestId(1), 3, 0);
        g.vcpu(2).unwrap().set_napping(true);
        let mut shadow = ShadowTlb0::new();
        // Only vCPU 1 is a non-napping, non-issuer target; the protocol
        // must complete after exactly that one acknowledgement, without
        // one from the napping vCPU 2.
        let guard = emu_tlbivax(&g, 0, &mut shadow, 0x5000);
        handle_tlbivax_gevent(&g, 1, &mut ShadowTlb0::new(), 0x5000);
        guard.wait();
    }

    #[test]
    fn tlbivax_local_invalidation_clears_issuers_shadow_and_tlb1() {
        let g = Guest::new(GuestId(1), 1, 0);
        let mut shadow = ShadowTlb0::new();
        shadow.install(0x6000, 0, false, 0, 0, 0x9000, 0, 0);
        let guard = emu_tlbivax(&g, 0, &mut shadow, 0x6000);
        guard.wait();
        assert!(shadow.lookup(0x6000, 0, false).is_none());
    }
}
</content>
