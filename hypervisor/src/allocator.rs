//! The global heap allocator, backed by a fixed region of hypervisor memory
//! carved out at link time.
//!
//! Grounded on the `linked_list_allocator` crate (seen in the corpus's
//! bare-metal kernels, e.g. `nathan237-TrustOS`'s `memory::heap`); the
//! teacher's own `BootTimeAllocator` delegated to UEFI boot services, which
//! do not exist once this hypervisor's own boot loader has handed off
//! control, so the underlying allocator strategy is replaced while its
//! shape -- one `#[global_allocator]` static, initialized once at boot --
//! is kept.

use linked_list_allocator::LockedHeap;

/// Size of the hypervisor's own heap, carved out of the memory reserved for
/// it by the boot loader (SPEC_FULL.md §1, out of scope for sizing policy;
/// this is simply the arena the core allocates handles, GPhys radix nodes,
/// and PAMU bindings out of).
const HEAP_SIZE: usize = 1 << 20;

#[repr(align(4096))]
struct HeapArena([u8; HEAP_SIZE]);

static mut HEAP_ARENA: HeapArena = HeapArena([0; HEAP_SIZE]);

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(test)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Initializes the global heap. Must be called exactly once, before any
/// allocation, from the boot core before secondaries are released.
///
/// # Safety
/// Must not be called more than once, and must happen-before any other core
/// observes the allocator as initialized.
pub(crate) unsafe fn init() {
    unsafe {
        let arena = core::ptr::addr_of_mut!(HEAP_ARENA);
        ALLOCATOR.lock().init((*arena).0.as_mut_ptr(), HEAP_SIZE);
    }
}
