pub use mm::{PAGE_BITS, PAGE_SIZE};

/// Upper bound on the number of supported processors. Per-CPU state is
/// kept in fixed arrays indexed by the CPU id.
pub const MAX_CPUS: usize = 16;

/// Number of scheduling priorities (0 = lowest).
pub const PRIORITIES: usize = 128;

/// IOMMU requester ids a protection domain may hold.
pub const NUM_RIDS: usize = 7;

/// First non-canonical address; user mappings must stay below this.
pub const USER_SPACE_END: usize = 0x0000_8000_0000_0000;
pub const USER_PAGES_END: usize = USER_SPACE_END >> PAGE_BITS;

/// Kernel heap backing the alloc crate.
pub const KERNEL_HEAP_SIZE: usize = 2 * 1024 * 1024;

/// Size of the physical pool handed to the buddy allocator.
pub const POOL_SIZE: usize = 8 * 1024 * 1024;
