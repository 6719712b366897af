/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: buddy                                                           ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Binary buddy allocator over one fixed physical pool.            ║
   ║         Allocations are power-of-two page blocks and are charged        ║
   ║         against a quota; freed blocks coalesce with their buddy.        ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, HHU                                             ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::quota::Quota;
use crate::{PAGE_BITS, PAGE_SIZE};
use core::cmp::min;
use core::fmt::{Debug, Formatter};
use core::ptr::NonNull;
use spin::Mutex;

/// Largest block order (4 MiB blocks).
pub const MAX_ORDER: usize = 10;

/// Free blocks are kept as intrusive lists inside the free memory itself.
struct FreeBlock {
    next: Option<NonNull<FreeBlock>>,
}

struct Inner {
    base: usize,
    pages: usize,
    free: [Option<NonNull<FreeBlock>>; MAX_ORDER + 1],
}

unsafe impl Send for Inner {}

pub struct BuddyAllocator {
    inner: Mutex<Inner>,
}

impl BuddyAllocator {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                base: 0,
                pages: 0,
                free: [None; MAX_ORDER + 1],
            }),
        }
    }

    /// Hand the pool to the allocator. `base` must be page aligned and the
    /// memory must not be touched by anyone else afterwards.
    pub unsafe fn init(&self, base: *mut u8, size: usize) {
        assert_eq!(base as usize % PAGE_SIZE, 0, "buddy pool is not page aligned");

        let mut inner = self.inner.lock();
        assert_eq!(inner.pages, 0, "buddy pool initialized twice");

        inner.base = base as usize;
        inner.pages = size >> PAGE_BITS;

        // Carve the pool into maximal naturally aligned blocks.
        let pages = inner.pages;
        let mut off = 0;
        while off < pages {
            let mut order = if off == 0 { MAX_ORDER } else { min(MAX_ORDER, off.trailing_zeros() as usize) };
            while off + (1 << order) > pages {
                order -= 1;
            }

            Self::push(&mut inner, off, order);
            off += 1 << order;
        }
    }

    /// Allocate a block of `1 << order` pages, charged against `quota`.
    pub fn alloc(&self, quota: &Quota, order: usize) -> Option<NonNull<u8>> {
        if order > MAX_ORDER {
            return None;
        }

        if !quota.charge(1 << order) {
            return None;
        }

        let mut inner = self.inner.lock();

        let mut split = order;
        while split <= MAX_ORDER && inner.free[split].is_none() {
            split += 1;
        }

        if split > MAX_ORDER {
            drop(inner);
            quota.credit(1 << order);
            return None;
        }

        let off = Self::pop(&mut inner, split).unwrap();
        while split > order {
            split -= 1;
            Self::push(&mut inner, off + (1 << split), split);
        }

        NonNull::new((inner.base + (off << PAGE_BITS)) as *mut u8)
    }

    /// Free a block previously obtained from `alloc` with the same order,
    /// crediting `quota`. Unsafe because a bogus pointer or order corrupts
    /// the free lists.
    pub unsafe fn free(&self, quota: &Quota, ptr: NonNull<u8>, order: usize) {
        quota.credit(1 << order);

        let mut inner = self.inner.lock();
        let mut off = (ptr.as_ptr() as usize - inner.base) >> PAGE_BITS;
        let mut order = order;

        // Coalesce with the buddy block as long as it is free too.
        while order < MAX_ORDER {
            let buddy = off ^ (1 << order);
            if buddy + (1 << order) > inner.pages || !Self::remove(&mut inner, buddy, order) {
                break;
            }

            off = min(off, buddy);
            order += 1;
        }

        Self::push(&mut inner, off, order);
    }

    /// Number of free pages left in the pool.
    pub fn free_pages(&self) -> usize {
        let inner = self.inner.lock();
        let mut total = 0;

        for order in 0..=MAX_ORDER {
            let mut cur = inner.free[order];
            while let Some(block) = cur {
                total += 1 << order;
                cur = unsafe { block.as_ref().next };
            }
        }

        total
    }

    fn push(inner: &mut Inner, page_off: usize, order: usize) {
        let block = (inner.base + (page_off << PAGE_BITS)) as *mut FreeBlock;
        unsafe { (*block).next = inner.free[order] };
        inner.free[order] = NonNull::new(block);
    }

    fn pop(inner: &mut Inner, order: usize) -> Option<usize> {
        let head = inner.free[order]?;
        inner.free[order] = unsafe { head.as_ref().next };
        Some((head.as_ptr() as usize - inner.base) >> PAGE_BITS)
    }

    fn remove(inner: &mut Inner, page_off: usize, order: usize) -> bool {
        let addr = inner.base + (page_off << PAGE_BITS);

        let mut prev: Option<NonNull<FreeBlock>> = None;
        let mut cur = inner.free[order];

        while let Some(block) = cur {
            let next = unsafe { block.as_ref().next };
            if block.as_ptr() as usize == addr {
                match prev {
                    Some(mut p) => unsafe { p.as_mut().next = next },
                    None => inner.free[order] = next,
                }
                return true;
            }

            prev = cur;
            cur = next;
        }

        false
    }
}

impl Debug for BuddyAllocator {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();

        for order in 0..=MAX_ORDER {
            let mut count = 0;
            let mut cur = inner.free[order];
            while let Some(block) = cur {
                count += 1;
                cur = unsafe { block.as_ref().next };
            }

            if count > 0 {
                write!(f, "Order: [{}], Free blocks: [{}]\n", order, count)?;
            }
        }

        write!(f, "Pool: [0x{:x} - 0x{:x}]", inner.base, inner.base + (inner.pages << PAGE_BITS))
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::alloc::{alloc, Layout};

    const POOL_PAGES: usize = 64;

    fn pool() -> (BuddyAllocator, Quota) {
        let layout = Layout::from_size_align(POOL_PAGES * PAGE_SIZE, PAGE_SIZE).unwrap();
        let base = unsafe { alloc(layout) };
        assert!(!base.is_null());

        let buddy = BuddyAllocator::new();
        unsafe { buddy.init(base, POOL_PAGES * PAGE_SIZE) };
        (buddy, Quota::new(POOL_PAGES))
    }

    #[test]
    fn pool_is_fully_available_after_init() {
        let (buddy, _quota) = pool();
        assert_eq!(buddy.free_pages(), POOL_PAGES);
    }

    #[test]
    fn alloc_splits_and_free_coalesces() {
        let (buddy, quota) = pool();

        let block = buddy.alloc(&quota, 2).unwrap();
        assert_eq!(buddy.free_pages(), POOL_PAGES - 4);
        assert_eq!(quota.used(), 4);
        assert_eq!(block.as_ptr() as usize % (4 * PAGE_SIZE), 0);

        unsafe { buddy.free(&quota, block, 2) };
        assert_eq!(buddy.free_pages(), POOL_PAGES);
        assert_eq!(quota.used(), 0);

        // After coalescing, a maximal block must be allocatable again.
        let big = buddy.alloc(&quota, 5).unwrap();
        unsafe { buddy.free(&quota, big, 5) };
    }

    #[test]
    fn quota_limits_allocation() {
        let (buddy, _) = pool();
        let quota = Quota::new(2);

        assert!(buddy.alloc(&quota, 2).is_none(), "over-quota allocation must fail");
        assert_eq!(quota.used(), 0);

        let a = buddy.alloc(&quota, 1).unwrap();
        assert!(buddy.alloc(&quota, 1).is_none());
        unsafe { buddy.free(&quota, a, 1) };
    }

    #[test]
    fn distinct_blocks_do_not_alias() {
        let (buddy, quota) = pool();

        let a = buddy.alloc(&quota, 0).unwrap();
        let b = buddy.alloc(&quota, 0).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());

        unsafe {
            buddy.free(&quota, a, 0);
            buddy.free(&quota, b, 0);
        }
        assert_eq!(buddy.free_pages(), POOL_PAGES);
    }
}
