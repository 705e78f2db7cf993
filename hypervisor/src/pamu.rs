//! The PAMU (IOMMU) configuration engine, SPEC_FULL.md §4.10.
//!
//! Grounded on the data model's `PAMU LIODN binding` (SPEC_FULL.md §3) and
//! the window/subwindow geometry rules in §4.10, both cross-checked against
//! `original_source/src/pamu.c`'s PAACE composition and the GPhys map this
//! module drives ([`crate::gphys::GphysMap`]). Access-violation handling
//! below follows `pamu.c::handle_access_violation` directly: attribute the
//! faulting LIODN to its owner, disable it, and hand back the record for
//! the caller to enqueue.

use alloc::vec::Vec;

use crate::config::{MAX_LIODNS, MAX_PAMU_SUBWINDOWS};
use crate::errors::{ErrorDomain, ErrorRecord};
use crate::gphys::GphysMap;
use crate::guest::GuestId;

/// `AVS1`'s LIODN field occupies the top 16 bits (`PAMU_AVS1_LIODN_SHIFT`,
/// `original_source/src/pamu.c::handle_access_violation`).
const AVS1_LIODN_SHIFT: u32 = 16;

/// A single subwindow of an LIODN's DMA window: its own GPA base and size,
/// each independently translated through the owning guest's GPhys map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Subwindow {
    pub(crate) guest_addr: u64,
    pub(crate) size: u64,
}

/// Where a DMA transaction on this LIODN is steered for cache residency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StashTarget {
    pub(crate) cache_level: u8,
    pub(crate) vcpu: u32,
}

/// The configuration-time, software source-of-truth for one LIODN's PAACE,
/// used to (re)compose the hardware PAACT/SPAACT entries on claim or
/// restart (SPEC_FULL.md §3).
#[derive(Debug, Clone)]
pub(crate) struct LiodnBinding {
    pub(crate) liodn: u32,
    pub(crate) owning_guest: GuestId,
    pub(crate) window_base_gpa: u64,
    pub(crate) window_size: u64,
    pub(crate) subwindows: Vec<Subwindow>,
    pub(crate) stash: Option<StashTarget>,
    pub(crate) enabled: bool,
}

/// A rejected PAMU configuration, per the geometry rules in SPEC_FULL.md
/// §4.10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PamuConfigError {
    /// `window_base` is not aligned to `window_size`.
    MisalignedWindow,
    /// `window_size` (or a subwindow size) is not a power of two, or below
    /// the 4 KiB floor.
    BadSize,
    /// `subwindow-count` is not a power of two, or exceeds the hardware
    /// limit.
    BadSubwindowCount,
    /// A subwindow's `guest-addr` is not in-window or not aligned.
    SubwindowOutOfRange,
    /// The window (or a subwindow) has no contiguous host-physical backing
    /// in the owning guest's GPhys map.
    Unbacked,
    /// The LIODN table is full.
    TableFull,
}

fn is_pow2(n: u64) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

const MIN_WINDOW_SIZE: u64 = 4096;

/// Validates and composes an un-subdivided window against `gphys`, per
/// SPEC_FULL.md §4.10 "If the window is un-subdivided".
fn validate_whole_window(
    window_base_gpa: u64,
    window_size: u64,
    gphys: &GphysMap,
) -> Result<(), PamuConfigError> {
    if window_size < MIN_WINDOW_SIZE || !is_pow2(window_size) {
        return Err(PamuConfigError::BadSize);
    }
    if window_base_gpa % window_size != 0 {
        return Err(PamuConfigError::MisalignedWindow);
    }
    let pages = window_size / MIN_WINDOW_SIZE;
    let (entry, run) = gphys.xlate_with_size((window_base_gpa / MIN_WINDOW_SIZE) as u32, pages as u32);
    if !entry.is_valid() || u64::from(run) < pages {
        return Err(PamuConfigError::Unbacked);
    }
    Ok(())
}

/// Validates each subwindow against its parent window and `gphys`, per
/// SPEC_FULL.md §4.10 "If subdivided".
fn validate_subwindows(
    window_base_gpa: u64,
    window_size: u64,
    subwindow_count: u32,
    subwindows: &[Subwindow],
    gphys: &GphysMap,
) -> Result<(), PamuConfigError> {
    if !is_pow2(u64::from(subwindow_count)) || subwindow_count as usize > MAX_PAMU_SUBWINDOWS {
        return Err(PamuConfigError::BadSubwindowCount);
    }
    let subwindow_size = window_size / u64::from(subwindow_count);
    let window_end = window_base_gpa + window_size;

    for sw in subwindows {
        if sw.size == 0 || sw.size > subwindow_size || !is_pow2(sw.size) {
            return Err(PamuConfigError::BadSize);
        }
        if sw.guest_addr % sw.size != 0 {
            return Err(PamuConfigError::SubwindowOutOfRange);
        }
        if sw.guest_addr < window_base_gpa || sw.guest_addr + sw.size > window_end {
            return Err(PamuConfigError::SubwindowOutOfRange);
        }
        let pages = sw.size / MIN_WINDOW_SIZE;
        let (entry, run) =
            gphys.xlate_with_size((sw.guest_addr / MIN_WINDOW_SIZE) as u32, pages.max(1) as u32);
        if !entry.is_valid() || u64::from(run) < pages.max(1) {
            return Err(PamuConfigError::Unbacked);
        }
    }
    Ok(())
}

/// The complete set of LIODN bindings a hypervisor instance tracks.
pub(crate) struct PamuTable {
    bindings: Vec<LiodnBinding>,
}

impl PamuTable {
    pub(crate) fn new() -> Self {
        Self { bindings: Vec::with_capacity(MAX_LIODNS) }
    }

    /// Configures a new un-subdivided LIODN window.
    pub(crate) fn configure_whole(
        &mut self,
        liodn: u32,
        owning_guest: GuestId,
        window_base_gpa: u64,
        window_size: u64,
        stash: Option<StashTarget>,
        gphys: &GphysMap,
    ) -> Result<(), PamuConfigError> {
        if self.bindings.len() >= MAX_LIODNS {
            return Err(PamuConfigError::TableFull);
        }
        validate_whole_window(window_base_gpa, window_size, gphys)?;
        self.bindings.push(LiodnBinding {
            liodn,
            owning_guest,
            window_base_gpa,
            window_size,
            subwindows: Vec::new(),
            stash,
            enabled: false,
        });
        Ok(())
    }

    /// Configures a subdivided LIODN window.
    pub(crate) fn configure_subdivided(
        &mut self,
        liodn: u32,
        owning_guest: GuestId,
        window_base_gpa: u64,
        window_size: u64,
        subwindows: Vec<Subwindow>,
        stash: Option<StashTarget>,
        gphys: &GphysMap,
    ) -> Result<(), PamuConfigError> {
        if self.bindings.len() >= MAX_LIODNS {
            return Err(PamuConfigError::TableFull);
        }
        if window_size < MIN_WINDOW_SIZE || !is_pow2(window_size) {
            return Err(PamuConfigError::BadSize);
        }
        if window_base_gpa % window_size != 0 {
            return Err(PamuConfigError::MisalignedWindow);
        }
        validate_subwindows(
            window_base_gpa,
            window_size,
            subwindows.len() as u32,
            &subwindows,
            gphys,
        )?;
        self.bindings.push(LiodnBinding {
            liodn,
            owning_guest,
            window_base_gpa,
            window_size,
            subwindows,
            stash,
            enabled: false,
        });
        Ok(())
    }

    fn index_of(&self, liodn: u32) -> Option<usize> {
        self.bindings.iter().position(|b| b.liodn == liodn)
    }

    /// `hcall_dma_enable`: toggles the PAACE valid bit on.
    pub(crate) fn enable(&mut self, liodn: u32) -> bool {
        match self.index_of(liodn) {
            Some(i) => {
                self.bindings[i].enabled = true;
                true
            }
            None => false,
        }
    }

    /// `hcall_dma_disable`: toggles the PAACE valid bit off. Also used by
    /// the access-violation handler's erratum workaround.
    pub(crate) fn disable(&mut self, liodn: u32) -> bool {
        match self.index_of(liodn) {
            Some(i) => {
                self.bindings[i].enabled = false;
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_enabled(&self, liodn: u32) -> bool {
        self.index_of(liodn).is_some_and(|i| self.bindings[i].enabled)
    }

    pub(crate) fn owner_of(&self, liodn: u32) -> Option<GuestId> {
        self.index_of(liodn).map(|i| self.bindings[i].owning_guest)
    }

    /// Services a PAMU access-violation interrupt (`handle_access_violation`):
    /// extracts the violating LIODN from `avs1`, disables it so it stops
    /// generating further interrupts, and returns the record to enqueue on
    /// its owning guest. Returns `None` for an LIODN this table never
    /// enabled -- the reference treats that case as a stale or spurious
    /// interrupt and just clears it ("we may get access violations for
    /// invalid LIODNs, just ignore them").
    pub(crate) fn handle_access_violation(
        &mut self,
        avs1: u32,
        avs2: u32,
        access_violation_addr: u64,
    ) -> Option<(GuestId, ErrorRecord)> {
        let liodn = avs1 >> AVS1_LIODN_SHIFT;
        if !self.is_enabled(liodn) {
            return None;
        }
        let owning_guest = self.owner_of(liodn)?;
        self.disable(liodn);
        Some((
            owning_guest,
            ErrorRecord {
                domain: ErrorDomain::Pamu {
                    avs1,
                    avs2,
                    access_violation_addr,
                    liodn_handle: liodn,
                    lpid: owning_guest.0,
                },
                hw_path: "pamu",
                guest_path: "",
            },
        ))
    }

    /// Reassigns `liodn` to `new_owner`, reconfiguring its window geometry
    /// against the new owner's GPhys map. The caller must have already
    /// verified the previous owner is stopped (SPEC_FULL.md §4.10 "On a
    /// claim").
    pub(crate) fn reassign(
        &mut self,
        liodn: u32,
        new_owner: GuestId,
        new_gphys: &GphysMap,
    ) -> Result<(), PamuConfigError> {
        let i = self.index_of(liodn).ok_or(PamuConfigError::TableFull)?;
        let binding = &self.bindings[i];
        if binding.subwindows.is_empty() {
            validate_whole_window(binding.window_base_gpa, binding.window_size, new_gphys)?;
        } else {
            validate_subwindows(
                binding.window_base_gpa,
                binding.window_size,
                binding.subwindows.len() as u32,
                &binding.subwindows,
                new_gphys,
            )?;
        }
        self.bindings[i].owning_guest = new_owner;
        self.bindings[i].enabled = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gphys::GphysAttr;

    fn backed_gphys(base_pn: u32, count: u32) -> GphysMap {
        let mut map = GphysMap::new();
        map.map(base_pn, base_pn, count, GphysAttr::VALID);
        map
    }

    #[test]
    fn whole_window_requires_alignment() {
        let gphys = backed_gphys(0x1000, 16);
        let mut table = PamuTable::new();
        let err = table
            .configure_whole(1, GuestId(1), 0x1000 * 4096 + 1, 16 * 4096, None, &gphys)
            .unwrap_err();
        assert_eq!(err, PamuConfigError::MisalignedWindow);
    }

    #[test]
    fn whole_window_requires_backing() {
        let gphys = GphysMap::new();
        let mut table = PamuTable::new();
        let err = table.configure_whole(1, GuestId(1), 0, 16 * 4096, None, &gphys).unwrap_err();
        assert_eq!(err, PamuConfigError::Unbacked);
    }

    #[test]
    fn whole_window_configures_and_enables() {
        let gphys = backed_gphys(0, 16);
        let mut table = PamuTable::new();
        table.configure_whole(5, GuestId(2), 0, 16 * 4096, None, &gphys).unwrap();
        assert!(!table.is_enabled(5));
        assert!(table.enable(5));
        assert!(table.is_enabled(5));
    }

    #[test]
    fn subwindow_count_must_be_power_of_two() {
        let gphys = backed_gphys(0, 16);
        let mut table = PamuTable::new();
        let subwindows = alloc::vec![
            Subwindow { guest_addr: 0, size: 4096 * 5 },
            Subwindow { guest_addr: 4096 * 5, size: 4096 * 3 },
            Subwindow { guest_addr: 4096 * 8, size: 4096 * 8 },
        ];
        let err = table
            .configure_subdivided(6, GuestId(1), 0, 16 * 4096, subwindows, None, &gphys)
            .unwrap_err();
        assert_eq!(err, PamuConfigError::BadSubwindowCount);
    }

    #[test]
    fn subwindow_out_of_window_range_is_rejected() {
        let gphys = backed_gphys(0, 16);
        let mut table = PamuTable::new();
        let subwindows = alloc::vec![
            Subwindow { guest_addr: 0, size: 8 * 4096 },
            Subwindow { guest_addr: 8 * 4096, size: 16 * 4096 },
        ];
        let err = table
            .configure_subdivided(7, GuestId(1), 0, 16 * 4096, subwindows, None, &gphys)
            .unwrap_err();
        assert_eq!(err, PamuConfigError::SubwindowOutOfRange);
    }

    #[test]
    fn disabling_an_unknown_liodn_is_a_no_op_failure() {
        let mut table = PamuTable::new();
        assert!(!table.disable(99));
    }

    #[test]
    fn reassign_requires_backing_in_new_owners_gphys() {
        let old_gphys = backed_gphys(0, 16);
        let mut table = PamuTable::new();
        table.configure_whole(3, GuestId(1), 0, 16 * 4096, None, &old_gphys).unwrap();
        table.enable(3);

        let unbacked_new_gphys = GphysMap::new();
        let err = table.reassign(3, GuestId(2), &unbacked_new_gphys).unwrap_err();
        assert_eq!(err, PamuConfigError::Unbacked);
        // Failed reassignment leaves ownership and enable state untouched.
        assert_eq!(table.owner_of(3), Some(GuestId(1)));
        assert!(table.is_enabled(3));
    }

    #[test]
    fn access_violation_on_disabled_liodn_is_ignored() {
        let gphys = backed_gphys(0, 16);
        let mut table = PamuTable::new();
        table.configure_whole(3, GuestId(1), 0, 16 * 4096, None, &gphys).unwrap();
        let avs1 = 3 << 16;
        assert!(table.handle_access_violation(avs1, 0, 0).is_none());
    }

    #[test]
    fn access_violation_attributes_guest_and_disables_liodn() {
        let gphys = backed_gphys(0, 16);
        let mut table = PamuTable::new();
        table.configure_whole(5, GuestId(7), 0, 16 * 4096, None, &gphys).unwrap();
        table.enable(5);
        let avs1 = (5 << 16) | 0xbeef;
        let (guest, record) = table.handle_access_violation(avs1, 0x55, 0x1000).unwrap();
        assert_eq!(guest, GuestId(7));
        assert!(!table.is_enabled(5));
        match record.domain {
            ErrorDomain::Pamu { liodn_handle, lpid, avs2, access_violation_addr, .. } => {
                assert_eq!(liodn_handle, 5);
                assert_eq!(lpid, 7);
                assert_eq!(avs2, 0x55);
                assert_eq!(access_violation_addr, 0x1000);
            }
            ErrorDomain::EccL2 { .. } => panic!("wrong variant"),
        }
    }

    #[test]
    fn access_violation_on_unknown_liodn_is_ignored() {
        let mut table = PamuTable::new();
        assert!(table.handle_access_violation(99 << 16, 0, 0).is_none());
    }

    #[test]
    fn successful_reassign_disables_and_retags_owner() {
        let old_gphys = backed_gphys(0, 16);
        let new_gphys = backed_gphys(0, 16);
        let mut table = PamuTable::new();
        table.configure_whole(4, GuestId(1), 0, 16 * 4096, None, &old_gphys).unwrap();
        table.enable(4);
        table.reassign(4, GuestId(2), &new_gphys).unwrap();
        assert_eq!(table.owner_of(4), Some(GuestId(2)));
        assert!(!table.is_enabled(4));
    }
}
</content>
