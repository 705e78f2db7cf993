//! The module containing various constants that may be modified by developers.

/// The logging level.
pub(crate) const LOGGING_LEVEL: log::LevelFilter = log::LevelFilter::Trace;

/// Maximum number of guest partitions the hypervisor can host simultaneously.
pub(crate) const MAX_GUESTS: usize = 16;

/// Maximum number of vCPUs (physical cores) in the system.
pub(crate) const MAX_CPUS: usize = 32;

/// Number of fully-associative TLB1 entries per vCPU.
///
/// Grounded on `original_source/include/vcpu.h`: `TLB1_SIZE`.
pub(crate) const TLB1_SIZE: usize = 16;

/// Number of general-purpose registers saved by the low-level exception entry
/// stubs before a handler has a stack to spill to.
///
/// Grounded on `original_source/include/vcpu.h`: `CPUSAVE_LEN`.
pub(crate) const CPUSAVE_LEN: usize = 8;

/// Number of direct-mapped shadow TLB0 slots per core.
///
/// The real hardware TLB0 is 4-way, 128-set per e500mc/e5500; the shadow cache
/// mirrors the flattened (way*set) index space.
pub(crate) const TLB0_SHADOW_SIZE: usize = 512;

/// Number of hypervisor-global handle slots (indices `0..GLOBAL_HANDLES`).
/// Per-guest handles are allocated starting at this index within the guest's
/// own table.
///
/// Grounded on `original_source/src/hcalls.c`: `GLOBAL_HANDLES`.
pub(crate) const GLOBAL_HANDLES: usize = 64;

/// Maximum number of handles (global + per-guest) any single guest's table
/// may hold.
pub(crate) const MAX_GUEST_HANDLES: usize = 256;

/// Number of performance-monitor counters virtualized per vCPU.
///
/// This mirrors the reference implementation's `NUM_PERF_CTRS`, which is a
/// fixed assumption rather than a detected processor property (see
/// SPEC_FULL.md §9 open questions).
pub(crate) const NUM_PERF_CTRS: usize = 4;

/// Whether an access to an SPR with no registered policy is reflected to the
/// guest as a program exception (`true`) or silently logged and treated as a
/// read-as-zero / ignored-write (`false`, matches reference behavior).
///
/// See SPEC_FULL.md §9 "Open-question decisions taken in this implementation".
pub(crate) const UNKNOWN_SPR_REFLECTS: bool = false;

/// Maximum number of scatter-gather entries accepted by a single
/// `partition_memcpy` hypercall before it is rejected with `EINVAL`.
pub(crate) const MAX_MEMCPY_SG_ENTRIES: usize = 16;

/// Maximum number of queued error records per guest (and for the global,
/// unattributable queue).
pub(crate) const ERROR_QUEUE_DEPTH: usize = 16;

/// Maximum number of LIODNs the PAMU engine tracks.
pub(crate) const MAX_LIODNS: usize = 64;

/// Maximum subwindows per PAMU window (hardware limit on this SoC family).
pub(crate) const MAX_PAMU_SUBWINDOWS: usize = 16;
</content>
