//! A type-1 hypervisor core for Freescale/NXP QorIQ e500mc/e5500
//! processors: guest TLB virtualization, SPR/PMR emulation, doorbell and
//! `tlbivax` cross-core synchronization, hypercall dispatch, partition
//! lifecycle, and the PAMU/IOMMU engine.
// Under `cfg(test)` this binary links std instead, so its architecture-
// neutral unit tests (SPEC_FULL.md §2A "Test tooling") run on the host
// toolchain; `ppc.rs`'s real instruction wrappers are themselves gated to
// `target_arch = "powerpc64"` and unreachable from those tests.
#![cfg_attr(not(test), no_main)]
#![cfg_attr(not(test), no_std)]
#![feature(panic_info_message)]
#![warn(
    // groups: https://doc.rust-lang.org/rustc/lints/groups.html
    future_incompatible,
    let_underscore,
    nonstandard_style,
    rust_2018_compatibility,
    rust_2018_idioms,
    rust_2021_compatibility,
    unused,

    // warnings that are not enabled by default or covered by groups
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    macro_use_extern_crate,
    meta_variable_misuse,
    missing_abi,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    non_ascii_idents,
    noop_method_call,
    single_use_lifetimes,
    trivial_numeric_casts,
    unreachable_pub,
    unsafe_op_in_unsafe_fn,
    unused_crate_dependencies,
    unused_import_braces,
    unused_lifetimes,
    unused_qualifications,
    unused_results,

    // https://github.com/rust-lang/rust-clippy/blob/master/README.md
    clippy::pedantic,
    clippy::cargo,

    // https://doc.rust-lang.org/rustdoc/lints.html
    rustdoc::missing_crate_level_docs,
    rustdoc::private_doc_tests,
    rustdoc::invalid_html_tags,
)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::multiple_crate_versions)]

#[cfg(not(target_pointer_width = "64"))]
compile_error!("This project must target the 64bit-width pointer environment.");

extern crate alloc;

mod allocator;
mod config;
mod devtree;
mod doorbell;
mod emulate;
mod errors;
mod gevent;
mod global_state;
mod gphys;
mod guest;
mod handle;
mod hcall;
mod hypervisor;
mod logger;
mod pamu;
mod panic;
mod pmr;
mod ppc;
mod spintable;
mod spr;
mod tlb;
mod vcpu;

use config::LOGGING_LEVEL;
use devtree::{HardwareTree, HvConfigTree};
use global_state::GlobalState;
use log::{error, info};
use logger::{HvLogger, NullSink};

/// The one [`GlobalState`] every core reads after boot. Written exactly
/// once, by whichever core reaches [`boot_core`] first; every other core
/// blocks on [`spin::Once::wait`] until that write has happened.
static GLOBAL: spin::Once<GlobalState> = spin::Once::new();

/// The boot-time logger. The byte-channel/16550 console this would
/// eventually front is out of scope (SPEC_FULL.md §1), so it is wired to
/// [`NullSink`] rather than a platform transport; swapping in a real sink
/// later needs no change outside this one static.
static LOGGER: HvLogger<NullSink> = HvLogger::new(NullSink, core_id);

fn core_id() -> u32 {
    // Safety: reading PIR has no side effect and is valid on every core at
    // any privilege level this hypervisor runs at.
    unsafe { ppc::mfspr_pir() as u32 }
}

/// The entry point of the program.
///
/// Called by the (out-of-scope, SPEC_FULL.md §1) assembly boot stub on
/// every core, once per core, after it has set up a stack. `devtree_ptr`
/// is the hardware device tree's physical address, per the ePAPR boot
/// protocol (the same pointer every core receives in `r3` on entry).
///
/// # Safety
/// `devtree_ptr` must point to a valid flattened device tree that remains
/// mapped for the life of the hypervisor, and this function must never be
/// called more than once per core.
#[no_mangle]
unsafe extern "C" fn hv_main(devtree_ptr: u64) -> ! {
    let this_core = core_id();

    if this_core == 0 {
        boot_core(devtree_ptr);
    }

    let global = GLOBAL.wait();
    info!("core {this_core} entering its idle loop");
    hypervisor::run_core(global, this_core)
}

/// One-time global initialization, performed by the first core to reach
/// [`hv_main`]. Every other core blocks in [`spin::Once::wait`] until this
/// returns.
fn boot_core(devtree_ptr: u64) -> ! {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LOGGING_LEVEL);
    info!("hypervisor core booting");

    // Safety: called exactly once, here, before any other core can reach
    // the allocator (every other core is still spinning on `GLOBAL`).
    unsafe { allocator::init() };

    // Safety: `devtree_ptr` is this function's own precondition.
    let hw = unsafe { HardwareTree::from_ptr(devtree_ptr as *const u8) }
        .unwrap_or_else(|err| fatal(err));
    let config_addr = hw
        .config_addr()
        .unwrap_or_else(|| fatal(errors::HvError::Fatal("no config-addr in /chosen/bootargs")));
    // Safety: `config_addr` was read out of the hardware device tree this
    // function's own precondition already guarantees is valid; the
    // hv-config blob it names is mapped by the same boot loader.
    let hv_config = unsafe { HvConfigTree::from_ptr(config_addr as *const u8) }
        .unwrap_or_else(|err| fatal(err));

    let global = GlobalState::new(&hw, &hv_config).unwrap_or_else(|err| fatal(err));
    info!(
        "parsed hv-config: {} partition(s), {} core(s)",
        global.guest_count(),
        global.number_of_cores()
    );
    let _ = GLOBAL.call_once(|| global);

    let global = GLOBAL.wait();
    hypervisor::run_core(global, 0)
}

/// Boot-time failures have nowhere left to go: there is no guest yet to
/// reflect an exception to, and no other core can make progress without
/// this one finishing `GlobalState::new`. Logs and halts.
fn fatal(err: errors::HvError) -> ! {
    error!("fatal boot error: {err:?}");
    // Safety: boot has not yet released any other core, so disabling this
    // core's interrupts has no effect on the rest of the system.
    unsafe { ppc::disable_interrupts() };
    ppc::halt();
}
</content>
