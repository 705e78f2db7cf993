//! The per-guest GPA → host-physical radix map ("GPhys map") and its
//! reverse table.
//!
//! Grounded on SPEC_FULL.md §4.1 and, for the two-level radix-build
//! discipline, on the teacher's nested paging structure builder in
//! `vm.rs::walk_table` (a recursive directory/leaf allocate-on-demand
//! radix walk), generalized here from nested page tables to a flat GPA
//! address space.

use alloc::boxed::Box;
use alloc::vec::Vec;

/// Outer directory size: 1024 pointers, each covering a 1024-entry leaf.
const DIR_ENTRIES: usize = 1024;
/// Leaf size: 1024 cells, each one 4 KiB GPA page.
const LEAF_ENTRIES: usize = 1024;

bitflags::bitflags! {
    /// Attribute bits carried by a [`GphysEntry`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct GphysAttr: u16 {
        /// The mapping is installable in hardware TLBs.
        const VALID = 1 << 0;
        /// Guest-user mode may write this page.
        const USER_WRITABLE = 1 << 1;
        /// Guest-user mode may execute this page.
        const USER_EXEC = 1 << 2;
        /// Cache-inhibited (device memory).
        const CACHE_INHIBIT = 1 << 3;
        /// Guarded (no speculative access).
        const GUARD = 1 << 4;
        /// Install is permitted, but any use must machine-check the guest.
        const VIRT_FAULT = 1 << 5;
    }
}

/// One 4 KiB cell of the GPhys map: a host RPN plus the naturally-aligned
/// run size it is known to start, plus attribute bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GphysEntry {
    /// Host page number (20 bits of real significance).
    pub(crate) rpn: u32,
    /// `log2` of the page count this entry's run extends for at minimum;
    /// used only as a hint by [`GphysMap::xlate_with_size`].
    pub(crate) tsize: u8,
    pub(crate) attr: GphysAttr,
}

impl GphysEntry {
    const INVALID: Self = Self { rpn: 0, tsize: 0, attr: GphysAttr::empty() };

    pub(crate) fn is_valid(&self) -> bool {
        self.attr.contains(GphysAttr::VALID)
    }
}

struct Leaf {
    cells: [GphysEntry; LEAF_ENTRIES],
}

impl Leaf {
    fn new() -> Box<Self> {
        Box::new(Self { cells: [GphysEntry::INVALID; LEAF_ENTRIES] })
    }
}

/// Two-level radix GPA → host-physical map, per SPEC_FULL.md §3/§4.1.
///
/// Single-writer (partition init or post-stop reconfiguration), many-reader
/// (guest execution); readers never lock because mutation only happens
/// while the owning guest is in a stopped-variant state (enforced by the
/// caller, typically `guest::Guest`, not by this type).
pub(crate) struct GphysMap {
    dir: Vec<Option<Box<Leaf>>>,
}

impl GphysMap {
    pub(crate) fn new() -> Self {
        let mut dir = Vec::with_capacity(DIR_ENTRIES);
        dir.resize_with(DIR_ENTRIES, || None);
        Self { dir }
    }

    fn split(gpa_pn: u32) -> (usize, usize) {
        let dir_index = (gpa_pn as usize >> 10) & (DIR_ENTRIES - 1);
        let leaf_index = gpa_pn as usize & (LEAF_ENTRIES - 1);
        (dir_index, leaf_index)
    }

    /// Looks up the page-number translation. An absent outer-directory slot
    /// returns `!VALID` without allocating a leaf.
    pub(crate) fn lookup(&self, gpa_pn: u32) -> GphysEntry {
        let (dir_index, leaf_index) = Self::split(gpa_pn);
        match &self.dir[dir_index] {
            Some(leaf) => leaf.cells[leaf_index],
            None => GphysEntry::INVALID,
        }
    }

    /// Installs `count` contiguous cells starting at `gpa_pn`, mapped to
    /// `rpn, rpn+1, .. rpn+count-1`, all carrying `attr`. Allocates leaves
    /// on demand.
    pub(crate) fn map(&mut self, gpa_pn: u32, rpn: u32, count: u32, attr: GphysAttr) {
        for i in 0..count {
            let (dir_index, leaf_index) = Self::split(gpa_pn + i);
            let leaf = self.dir[dir_index].get_or_insert_with(Leaf::new);
            leaf.cells[leaf_index] = GphysEntry { rpn: rpn + i, tsize: 0, attr };
        }
    }

    /// Marks `count` contiguous cells starting at `gpa_pn` as `!VALID`,
    /// without deallocating their leaf.
    pub(crate) fn unmap(&mut self, gpa_pn: u32, count: u32) {
        for i in 0..count {
            let (dir_index, leaf_index) = Self::split(gpa_pn + i);
            if let Some(leaf) = &mut self.dir[dir_index] {
                leaf.cells[leaf_index] = GphysEntry::INVALID;
            }
        }
    }

    /// Returns the largest naturally-aligned power-of-four page run, at most
    /// `max_tsize_pages` pages, starting at `gpa_pn`, that is homogeneous in
    /// both RPN contiguity and attribute bits. `tsize` in the result is the
    /// page count of that run.
    ///
    /// Per SPEC_FULL.md §4.1 and Testable Property 2: re-`lookup` of any
    /// page inside the returned run yields contiguous RPNs and identical
    /// attr bits.
    pub(crate) fn xlate_with_size(&self, gpa_pn: u32, max_tsize_pages: u32) -> (GphysEntry, u32) {
        let base = self.lookup(gpa_pn);
        if !base.is_valid() || max_tsize_pages <= 1 {
            return (base, 1);
        }

        let mut run: u32 = 1;
        let mut candidate = run * 4;
        while candidate <= max_tsize_pages && (gpa_pn % candidate) == 0 {
            let mut homogeneous = true;
            for i in 1..candidate {
                let e = self.lookup(gpa_pn + i);
                if !e.is_valid() || e.attr != base.attr || e.rpn != base.rpn + i {
                    homogeneous = false;
                    break;
                }
            }
            if !homogeneous {
                break;
            }
            run = candidate;
            candidate *= 4;
        }
        (base, run)
    }
}

/// Host-PFN → GPA-PFN symmetric table, used for error attribution and
/// host-initiated DMA checking (SPEC_FULL.md §3 "Reverse GPhys").
pub(crate) struct ReverseGphys {
    map: GphysMap,
}

impl ReverseGphys {
    pub(crate) fn new() -> Self {
        Self { map: GphysMap::new() }
    }

    pub(crate) fn record(&mut self, host_pn: u32, gpa_pn: u32, count: u32) {
        self.map.map(host_pn, gpa_pn, count, GphysAttr::VALID);
    }

    pub(crate) fn lookup(&self, host_pn: u32) -> Option<u32> {
        let e = self.map.lookup(host_pn);
        e.is_valid().then_some(e.rpn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_absent_directory_slot_is_invalid_without_allocating() {
        let map = GphysMap::new();
        let e = map.lookup(0x12345);
        assert!(!e.is_valid());
        assert!(map.dir.iter().all(Option::is_none));
    }

    #[test]
    fn map_then_lookup_round_trips() {
        let mut map = GphysMap::new();
        map.map(0x1000, 0x2000, 16, GphysAttr::VALID | GphysAttr::USER_WRITABLE);
        let e = map.lookup(0x1004);
        assert!(e.is_valid());
        assert_eq!(e.rpn, 0x2004);
        assert!(e.attr.contains(GphysAttr::USER_WRITABLE));
    }

    #[test]
    fn unmap_invalidates_without_touching_neighbors() {
        let mut map = GphysMap::new();
        map.map(0, 0x3000, 4, GphysAttr::VALID);
        map.unmap(1, 1);
        assert!(map.lookup(0).is_valid());
        assert!(!map.lookup(1).is_valid());
        assert!(map.lookup(2).is_valid());
    }

    #[test]
    fn xlate_with_size_returns_contiguous_homogeneous_run() {
        let mut map = GphysMap::new();
        map.map(0x1000, 0x2000, 64, GphysAttr::VALID);
        let (entry, run) = map.xlate_with_size(0x1000, 64);
        assert!(entry.is_valid());
        assert_eq!(run, 64);
        for i in 0..run {
            let e = map.lookup(0x1000 + i);
            assert_eq!(e.rpn, entry.rpn + i);
            assert_eq!(e.attr, entry.attr);
        }
    }

    #[test]
    fn xlate_with_size_stops_at_attribute_discontinuity() {
        let mut map = GphysMap::new();
        map.map(0x2000, 0x4000, 4, GphysAttr::VALID);
        map.map(0x2004, 0x4004, 4, GphysAttr::VALID | GphysAttr::CACHE_INHIBIT);
        let (_, run) = map.xlate_with_size(0x2000, 16);
        assert_eq!(run, 4);
    }

    #[test]
    fn xlate_with_size_on_invalid_entry_returns_run_of_one() {
        let map = GphysMap::new();
        let (entry, run) = map.xlate_with_size(0xabc, 64);
        assert!(!entry.is_valid());
        assert_eq!(run, 1);
    }
}
</content>
