//! The module containing the [`panic_handler`] function.
//!
//! Only registered as the `#[panic_handler]` outside `cfg(test)`: under
//! `cfg(test)` this binary links std (see main.rs), which supplies its own.

#![cfg(not(test))]

use alloc::string::ToString;
use log::error;

use crate::ppc;

#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    if let Some(location) = info.location() {
        error!(
            "panicked at '{}', {}:{}:{}",
            info.message().to_string(),
            location.file(),
            location.line(),
            location.column()
        );
    }
    // Stop execution of the current processor as much as possible. A panic
    // is the one path allowed to be fatal; there is nothing left to restore
    // interrupts for.
    unsafe { ppc::disable_interrupts() };
    ppc::halt();
}
