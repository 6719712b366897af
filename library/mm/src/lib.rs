/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: lib                                                             ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Physical memory primitives: a buddy allocator over one fixed    ║
   ║         pool, slab caches for kernel objects and page quotas charged    ║
   ║         on every allocation.                                            ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland & Michael Schoettner, HHU                        ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
#![no_std]

pub mod buddy;
pub mod quota;
pub mod slab;

pub use buddy::BuddyAllocator;
pub use quota::Quota;
pub use slab::SlabCache;

pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_BITS: usize = 12;
