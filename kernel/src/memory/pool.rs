/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: pool                                                            ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: The fixed physical pool. All kernel object memory, mapping      ║
   ║         database nodes and shadow page tables are carved out of this    ║
   ║         arena through the buddy allocator, charged against the owning   ║
   ║         domain's quota.                                                 ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, HHU                                             ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::consts::POOL_SIZE;
use core::cell::UnsafeCell;
use mm::{BuddyAllocator, PAGE_BITS};
use spin::Once;

// Aligned to its own size, so the root mappings carve into a handful of
// maximal naturally aligned nodes.
#[repr(C, align(4194304))]
struct PoolArena(UnsafeCell<[u8; POOL_SIZE]>);

unsafe impl Sync for PoolArena {}

static ARENA: PoolArena = PoolArena(UnsafeCell::new([0; POOL_SIZE]));
static BUDDY: BuddyAllocator = BuddyAllocator::new();
static INIT: Once<()> = Once::new();

pub fn init() {
    INIT.call_once(|| {
        unsafe { BUDDY.init(ARENA.0.get() as *mut u8, POOL_SIZE) };
    });
}

pub fn buddy() -> &'static BuddyAllocator {
    &BUDDY
}

/// First page number of the pool. The pool is identity mapped, so page
/// numbers double as physical frame numbers.
pub fn base_page() -> usize {
    ARENA.0.get() as usize >> PAGE_BITS
}

pub fn pages() -> usize {
    POOL_SIZE >> PAGE_BITS
}
