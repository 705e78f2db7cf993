//! The module containing thin `unsafe` wrappers around PowerPC e500mc/e5500
//! privileged instructions.
//!
//! None of these functions validate their arguments; callers (the emulator
//! and the TLB walker) are responsible for composing architecturally valid
//! register contents before calling through.
//!
//! Every wrapper below has a `#[cfg(not(target_arch = "powerpc64"))]`
//! counterpart that panics instead of assembling. This lets the crate build
//! (and its architecture-neutral unit tests run) on the host toolchain per
//! SPEC_FULL.md §2A; nothing in this module is reachable from those tests,
//! only from the boot path and the trap dispatcher, both PowerPC-only.

use core::arch::asm;

/// Generates a pair of `mfspr`/`mtspr` wrapper functions for one
/// architectural SPR number.
///
/// `mfspr`/`mtspr` encode the register number as an immediate in the
/// instruction word, so it must be known at compile time; this is why
/// access goes through one generated function per register rather than a
/// single function taking `spr: u32`. [`crate::spr`] matches on the
/// (runtime) [`crate::spr::SprId`] and calls through to the matching
/// generated function.
macro_rules! spr_accessor {
    ($(#[$meta:meta])* $mf:ident, $mt:ident, $num:expr) => {
        $(#[$meta])*
        #[cfg(target_arch = "powerpc64")]
        #[inline]
        pub(crate) unsafe fn $mf() -> u64 {
            let value: u64;
            unsafe {
                asm!("mfspr {0}, {1}", out(reg) value, const $num, options(nostack, preserves_flags));
            }
            value
        }
        $(#[$meta])*
        #[cfg(not(target_arch = "powerpc64"))]
        #[inline]
        pub(crate) unsafe fn $mf() -> u64 {
            unimplemented!("powerpc64-only instruction")
        }

        $(#[$meta])*
        #[cfg(target_arch = "powerpc64")]
        #[inline]
        pub(crate) unsafe fn $mt(value: u64) {
            unsafe {
                asm!("mtspr {1}, {0}", in(reg) value, const $num, options(nostack, preserves_flags));
            }
        }
        $(#[$meta])*
        #[cfg(not(target_arch = "powerpc64"))]
        #[inline]
        pub(crate) unsafe fn $mt(_value: u64) {
            unimplemented!("powerpc64-only instruction")
        }
    };
}

/// Generates a pair of `mfpmr`/`mtpmr` wrapper functions for one PMR number.
macro_rules! pmr_accessor {
    ($mf:ident, $mt:ident, $num:expr) => {
        #[cfg(target_arch = "powerpc64")]
        #[inline]
        pub(crate) unsafe fn $mf() -> u64 {
            let value: u64;
            unsafe {
                asm!("mfpmr {0}, {1}", out(reg) value, const $num, options(nostack, preserves_flags));
            }
            value
        }
        #[cfg(not(target_arch = "powerpc64"))]
        #[inline]
        pub(crate) unsafe fn $mf() -> u64 {
            unimplemented!("powerpc64-only instruction")
        }

        #[cfg(target_arch = "powerpc64")]
        #[inline]
        pub(crate) unsafe fn $mt(value: u64) {
            unsafe {
                asm!("mtpmr {1}, {0}", in(reg) value, const $num, options(nostack, preserves_flags));
            }
        }
        #[cfg(not(target_arch = "powerpc64"))]
        #[inline]
        pub(crate) unsafe fn $mt(_value: u64) {
            unimplemented!("powerpc64-only instruction")
        }
    };
}

spr_accessor!(mfspr_xer, mtspr_xer, 0x001);
spr_accessor!(mfspr_lr, mtspr_lr, 0x008);
spr_accessor!(mfspr_ctr, mtspr_ctr, 0x009);
spr_accessor!(mfspr_dec, mtspr_dec, 22);
spr_accessor!(mfspr_srr0, mtspr_srr0, 0x01a);
spr_accessor!(mfspr_srr1, mtspr_srr1, 0x01b);
spr_accessor!(mfspr_pid, mtspr_pid, 0x030);
spr_accessor!(mfspr_csrr0, mtspr_csrr0, 0x03a);
spr_accessor!(mfspr_csrr1, mtspr_csrr1, 0x03b);
spr_accessor!(mfspr_ivpr, mtspr_ivpr, 0x03f);
spr_accessor!(mfspr_dear, mtspr_dear, 0x3d5);
spr_accessor!(mfspr_esr, mtspr_esr, 0x3e);
spr_accessor!(mfspr_mcsrr0, mtspr_mcsrr0, 570);
spr_accessor!(mfspr_mcsrr1, mtspr_mcsrr1, 571);
spr_accessor!(mfspr_gsrr0, mtspr_gsrr0, 699);
spr_accessor!(mfspr_gsrr1, mtspr_gsrr1, 700);
spr_accessor!(mfspr_gdear, mtspr_gdear, 0x392);
spr_accessor!(mfspr_gesr, mtspr_gesr, 0x393);
spr_accessor!(mfspr_tbl, mtspr_tbl, 0x11c);
spr_accessor!(mfspr_tbu, mtspr_tbu, 0x11d);
spr_accessor!(mfspr_usprg0, mtspr_usprg0, 0x100);
spr_accessor!(mfspr_sprg0, mtspr_sprg0, 0x110);
spr_accessor!(mfspr_sprg1, mtspr_sprg1, 0x111);
spr_accessor!(mfspr_sprg2, mtspr_sprg2, 0x112);
spr_accessor!(mfspr_sprg3, mtspr_sprg3, 0x113);
spr_accessor!(mfspr_sprg4, mtspr_sprg4, 0x114);
spr_accessor!(mfspr_sprg5, mtspr_sprg5, 0x115);
spr_accessor!(mfspr_sprg6, mtspr_sprg6, 0x116);
spr_accessor!(mfspr_gsprg0, mtspr_gsprg0, 0x11c);
spr_accessor!(mfspr_gsprg1, mtspr_gsprg1, 0x11d);
spr_accessor!(mfspr_gsprg2, mtspr_gsprg2, 0x11e);
spr_accessor!(mfspr_gsprg3, mtspr_gsprg3, 0x11f);
spr_accessor!(mfspr_hid0, mtspr_hid0, 0x3f0);
spr_accessor!(mfspr_dbcr0, mtspr_dbcr0, 0x134);
spr_accessor!(mfspr_mas0, mtspr_mas0, 0x270);
spr_accessor!(mfspr_mas1, mtspr_mas1, 0x271);
spr_accessor!(mfspr_mas2, mtspr_mas2, 0x272);
spr_accessor!(mfspr_mas3, mtspr_mas3, 0x273);
spr_accessor!(mfspr_mas4, mtspr_mas4, 0x274);
spr_accessor!(mfspr_mas5, mtspr_mas5, 0x275);
spr_accessor!(mfspr_mas6, mtspr_mas6, 0x276);
spr_accessor!(mfspr_mas7, mtspr_mas7, 0x3b0);
spr_accessor!(mfspr_mas8, mtspr_mas8, 0x277);
spr_accessor!(mfspr_lpid, mtspr_lpid, 638);
spr_accessor!(mfspr_pir, mtspr_pir, 286);
spr_accessor!(mfspr_tlb0cfg, mtspr_tlb0cfg, 0x2b0);
spr_accessor!(mfspr_tlb1cfg, mtspr_tlb1cfg, 0x2b1);

macro_rules! ivor_accessor {
    ($mf:ident, $mt:ident, $num:expr) => {
        spr_accessor!($mf, $mt, $num);
    };
}
ivor_accessor!(mfspr_ivor0, mtspr_ivor0, 0x190);
ivor_accessor!(mfspr_ivor1, mtspr_ivor1, 0x191);
ivor_accessor!(mfspr_ivor2, mtspr_ivor2, 0x192);
ivor_accessor!(mfspr_ivor3, mtspr_ivor3, 0x193);
ivor_accessor!(mfspr_ivor4, mtspr_ivor4, 0x194);
ivor_accessor!(mfspr_ivor5, mtspr_ivor5, 0x195);
ivor_accessor!(mfspr_ivor6, mtspr_ivor6, 0x196);
ivor_accessor!(mfspr_ivor7, mtspr_ivor7, 0x197);
ivor_accessor!(mfspr_ivor8, mtspr_ivor8, 0x198);
ivor_accessor!(mfspr_ivor9, mtspr_ivor9, 0x199);
ivor_accessor!(mfspr_ivor10, mtspr_ivor10, 0x19a);
ivor_accessor!(mfspr_ivor11, mtspr_ivor11, 0x19b);
ivor_accessor!(mfspr_ivor12, mtspr_ivor12, 0x19c);
ivor_accessor!(mfspr_ivor13, mtspr_ivor13, 0x19d);
ivor_accessor!(mfspr_ivor14, mtspr_ivor14, 0x19e);
ivor_accessor!(mfspr_ivor15, mtspr_ivor15, 0x19f);
ivor_accessor!(mfspr_ivor32, mtspr_ivor32, 0x210);
ivor_accessor!(mfspr_ivor33, mtspr_ivor33, 0x211);
ivor_accessor!(mfspr_ivor34, mtspr_ivor34, 0x212);
ivor_accessor!(mfspr_ivor35, mtspr_ivor35, 0x213);
ivor_accessor!(mfspr_ivor36, mtspr_ivor36, 0x214);
ivor_accessor!(mfspr_ivor37, mtspr_ivor37, 0x215);
ivor_accessor!(mfspr_ivor38, mtspr_ivor38, 0x216);
ivor_accessor!(mfspr_ivor39, mtspr_ivor39, 0x217);
ivor_accessor!(mfspr_ivor40, mtspr_ivor40, 0x218);
ivor_accessor!(mfspr_ivor41, mtspr_ivor41, 0x219);

pmr_accessor!(mfpmr_pmc0, mtpmr_pmc0, 16);
pmr_accessor!(mfpmr_pmc1, mtpmr_pmc1, 17);
pmr_accessor!(mfpmr_pmc2, mtpmr_pmc2, 18);
pmr_accessor!(mfpmr_pmc3, mtpmr_pmc3, 19);
pmr_accessor!(mfpmr_pmlca0, mtpmr_pmlca0, 144);
pmr_accessor!(mfpmr_pmlcb0, mtpmr_pmlcb0, 145);
pmr_accessor!(mfpmr_pmgc0, mtpmr_pmgc0, 400);

/// Writes MAS0..MAS8 from `regs` (any entries the caller has not set must
/// already hold the desired hardware value) and executes `tlbwe`.
///
/// # Safety
/// The caller must have composed an architecturally valid MAS register set;
/// an invalid TLB1 index or reserved bit pattern is undefined behavior on
/// real hardware.
#[cfg(target_arch = "powerpc64")]
#[inline]
pub(crate) unsafe fn tlbwe() {
    unsafe {
        asm!("tlbwe", options(nostack, preserves_flags));
    }
}
#[cfg(not(target_arch = "powerpc64"))]
#[inline]
pub(crate) unsafe fn tlbwe() {
    unimplemented!("powerpc64-only instruction")
}

/// Reads the real hardware TLB entry addressed by the current MAS0 (and
/// MAS2 hash for TLB0) into MAS1..MAS8.
///
/// # Safety
/// MAS0 must already select a valid TLB array/way/entry.
#[cfg(target_arch = "powerpc64")]
#[inline]
pub(crate) unsafe fn tlbre() {
    unsafe {
        asm!("tlbre", options(nostack, preserves_flags));
    }
}
#[cfg(not(target_arch = "powerpc64"))]
#[inline]
pub(crate) unsafe fn tlbre() {
    unimplemented!("powerpc64-only instruction")
}

/// Searches the hardware TLB for an entry matching MAS6/current PID and, if
/// found, loads MAS0..MAS8 with its contents and sets `MAS1.VALID`.
///
/// # Safety
/// Caller must have set up MAS6 beforehand.
#[cfg(target_arch = "powerpc64")]
#[inline]
pub(crate) unsafe fn tlbsx(ea: u64) {
    unsafe {
        asm!("tlbsx 0, {0}", in(reg) ea, options(nostack, preserves_flags));
    }
}
#[cfg(not(target_arch = "powerpc64"))]
#[inline]
pub(crate) unsafe fn tlbsx(_ea: u64) {
    unimplemented!("powerpc64-only instruction")
}

/// Invalidates a hardware TLB entry matching `ea` and the current LPID/PID,
/// broadcasting to all cores sharing the TLB.
///
/// # Safety
/// Must only be called with interrupts appropriately managed by the caller
/// per the `tlbivax` synchronization protocol.
#[cfg(target_arch = "powerpc64")]
#[inline]
pub(crate) unsafe fn tlbivax(ea: u64) {
    unsafe {
        asm!("tlbivax 0, {0}", in(reg) ea, options(nostack, preserves_flags));
    }
}
#[cfg(not(target_arch = "powerpc64"))]
#[inline]
pub(crate) unsafe fn tlbivax(_ea: u64) {
    unimplemented!("powerpc64-only instruction")
}

/// Generates a `tlbilx` wrapper hardcoding its `T` field, which the
/// architecture encodes as an immediate and so must be known at compile
/// time; [`crate::emulate::emu_tlbilx`] picks the matching function for the
/// guest's requested invalidation type.
macro_rules! tlbilx_accessor {
    ($name:ident, $t:expr) => {
        /// # Safety
        /// Must only invalidate entries tagged with the issuing guest's LPID.
        #[cfg(target_arch = "powerpc64")]
        #[inline]
        pub(crate) unsafe fn $name(ea: u64) {
            unsafe {
                asm!("tlbilx {0}, 0, {1}", const $t, in(reg) ea, options(nostack, preserves_flags));
            }
        }
        #[cfg(not(target_arch = "powerpc64"))]
        #[inline]
        pub(crate) unsafe fn $name(_ea: u64) {
            unimplemented!("powerpc64-only instruction")
        }
    };
}

tlbilx_accessor!(tlbilx_lpid, 0);
tlbilx_accessor!(tlbilx_pid, 1);
tlbilx_accessor!(tlbilx_addr, 3);

/// Synchronizes outstanding TLB/page-table-walk state; a barrier only, never
/// invalidates anything by itself.
///
/// # Safety
/// None beyond ordinary instruction-ordering assumptions.
#[cfg(target_arch = "powerpc64")]
#[inline]
pub(crate) unsafe fn tlbsync() {
    unsafe {
        asm!("tlbsync", options(nostack, preserves_flags));
    }
}
#[cfg(not(target_arch = "powerpc64"))]
#[inline]
pub(crate) unsafe fn tlbsync() {
    unimplemented!("powerpc64-only instruction")
}

/// Sends an interprocessor doorbell message. `msg` is the full contents of
/// the message register (already LPID-tag-rewritten by the emulator).
///
/// # Safety
/// May wake a napping core; caller must have already updated the target
/// vCPU's pending-message bit before calling.
#[cfg(target_arch = "powerpc64")]
#[inline]
pub(crate) unsafe fn msgsnd(msg: u64) {
    unsafe {
        asm!("msgsnd {0}", in(reg) msg, options(nostack, preserves_flags));
    }
}
#[cfg(not(target_arch = "powerpc64"))]
#[inline]
pub(crate) unsafe fn msgsnd(_msg: u64) {
    unimplemented!("powerpc64-only instruction")
}

/// Clears a pending doorbell message type on the local core.
///
/// # Safety
/// None beyond ordinary instruction-ordering assumptions.
#[cfg(target_arch = "powerpc64")]
#[inline]
pub(crate) unsafe fn msgclr(msg: u64) {
    unsafe {
        asm!("msgclr {0}", in(reg) msg, options(nostack, preserves_flags));
    }
}
#[cfg(not(target_arch = "powerpc64"))]
#[inline]
pub(crate) unsafe fn msgclr(_msg: u64) {
    unimplemented!("powerpc64-only instruction")
}

/// Returns from a critical-class exception, restoring MSR/NIP from CSRR1/CSRR0.
///
/// # Safety
/// CSRR0/CSRR1 must hold a valid return address/MSR.
#[cfg(target_arch = "powerpc64")]
#[inline]
pub(crate) unsafe fn rfci() {
    unsafe {
        asm!("rfci", options(nostack, noreturn));
    }
}
#[cfg(not(target_arch = "powerpc64"))]
#[inline]
pub(crate) unsafe fn rfci() {
    unimplemented!("powerpc64-only instruction")
}

/// Returns from a machine-check exception, restoring MSR/NIP from MCSRR1/MCSRR0.
///
/// # Safety
/// MCSRR0/MCSRR1 must hold a valid return address/MSR.
#[cfg(target_arch = "powerpc64")]
#[inline]
pub(crate) unsafe fn rfmci() {
    unsafe {
        asm!("rfmci", options(nostack, noreturn));
    }
}
#[cfg(not(target_arch = "powerpc64"))]
#[inline]
pub(crate) unsafe fn rfmci() {
    unimplemented!("powerpc64-only instruction")
}

/// Disables external, critical and machine-check interrupts, returning the
/// previous MSR so the caller can restore it on every exit path.
///
/// # Safety
/// Must be paired with [`restore_interrupts`] on every exit path, including
/// early returns from `?`, or interrupts remain disabled indefinitely.
#[cfg(target_arch = "powerpc64")]
#[inline]
pub(crate) unsafe fn disable_interrupts() -> u64 {
    let msr: u64;
    unsafe {
        asm!(
            "mfmsr {0}",
            "wrteei 0",
            out(reg) msr,
            options(nostack, preserves_flags)
        );
    }
    msr
}
#[cfg(not(target_arch = "powerpc64"))]
#[inline]
pub(crate) unsafe fn disable_interrupts() -> u64 {
    unimplemented!("powerpc64-only instruction")
}

/// Restores the MSR captured by [`disable_interrupts`].
///
/// # Safety
/// `saved_msr` must be a value previously returned by
/// [`disable_interrupts`] on the same core.
#[cfg(target_arch = "powerpc64")]
#[inline]
pub(crate) unsafe fn restore_interrupts(saved_msr: u64) {
    unsafe {
        if (saved_msr & 0x8000) != 0 {
            asm!("wrteei 1", options(nostack, preserves_flags));
        }
    }
}
#[cfg(not(target_arch = "powerpc64"))]
#[inline]
pub(crate) unsafe fn restore_interrupts(_saved_msr: u64) {
    unimplemented!("powerpc64-only instruction")
}

/// Idles the core in a tight `wait`-instruction loop, never returning. Used
/// only by the panic handler, after interrupts have been disabled, to stop
/// the core as inertly as possible.
#[cfg(target_arch = "powerpc64")]
#[inline]
pub(crate) fn halt() -> ! {
    loop {
        unsafe { asm!("wait", options(nostack, preserves_flags, nomem)) };
    }
}
#[cfg(not(target_arch = "powerpc64"))]
#[inline]
pub(crate) fn halt() -> ! {
    unimplemented!("powerpc64-only instruction")
}

/// A scoped guard that disables interrupts on construction and restores the
/// prior state unconditionally on drop, so every exit path -- including an
/// early `?` -- re-enables interrupts exactly once.
#[must_use]
pub(crate) struct CriticalSection {
    saved_msr: u64,
}

impl CriticalSection {
    /// Disables interrupts and returns a guard that restores them on drop.
    ///
    /// # Safety
    /// Must not be nested in a way that interleaves with another direct
    /// caller of [`disable_interrupts`]/[`restore_interrupts`] on the same
    /// core.
    #[inline]
    pub(crate) unsafe fn enter() -> Self {
        Self { saved_msr: unsafe { disable_interrupts() } }
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        unsafe { restore_interrupts(self.saved_msr) };
    }
}
