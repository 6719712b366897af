/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: slab                                                            ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Slab caches for fixed-size kernel objects. A cache refills      ║
   ║         itself one page at a time from the buddy allocator; the page    ║
   ║         is what gets charged to the owning quota. Pages go back to      ║
   ║         the buddy only when the cache is destroyed.                     ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, HHU                                             ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::buddy::BuddyAllocator;
use crate::quota::Quota;
use crate::PAGE_SIZE;
use core::mem::size_of;
use core::ptr::NonNull;
use spin::Mutex;

const OBJ_ALIGN: usize = 16;

struct FreeObj {
    next: Option<NonNull<FreeObj>>,
}

struct PageHeader {
    next: Option<NonNull<PageHeader>>,
}

struct SlabInner {
    free: Option<NonNull<FreeObj>>,
    pages: Option<NonNull<PageHeader>>,
}

unsafe impl Send for SlabInner {}

/// A cache of free objects of one size.
pub struct SlabCache {
    obj_size: usize,
    inner: Mutex<SlabInner>,
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

impl SlabCache {
    pub const fn new(obj_size: usize) -> Self {
        let obj_size = align_up(
            if obj_size < size_of::<FreeObj>() { size_of::<FreeObj>() } else { obj_size },
            OBJ_ALIGN,
        );

        Self {
            obj_size,
            inner: Mutex::new(SlabInner { free: None, pages: None }),
        }
    }

    pub fn obj_size(&self) -> usize {
        self.obj_size
    }

    /// Allocate one object. Grabs a fresh page from `buddy` (charged to
    /// `quota`) when the cache is empty.
    pub fn alloc(&self, buddy: &BuddyAllocator, quota: &Quota) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock();

        if inner.free.is_none() {
            let page = buddy.alloc(quota, 0)?;
            unsafe { self.refill(&mut inner, page) };
        }

        let obj = inner.free.unwrap();
        inner.free = unsafe { obj.as_ref().next };
        Some(obj.cast())
    }

    /// Return one object to the cache. Unsafe because the pointer must
    /// come from `alloc` on the same cache and must not be used afterwards.
    pub unsafe fn free(&self, obj: NonNull<u8>) {
        let mut inner = self.inner.lock();

        let obj = obj.cast::<FreeObj>();
        unsafe { (*obj.as_ptr()).next = inner.free };
        inner.free = Some(obj);
    }

    /// Give all pages back to the buddy, crediting `quota`. Unsafe because
    /// every object handed out must have been freed before.
    pub unsafe fn destroy(&self, buddy: &BuddyAllocator, quota: &Quota) {
        let mut inner = self.inner.lock();

        let mut page = inner.pages.take();
        inner.free = None;

        while let Some(header) = page {
            page = unsafe { header.as_ref().next };
            unsafe { buddy.free(quota, header.cast(), 0) };
        }
    }

    /// Carve a fresh page into objects and thread them onto the free list.
    unsafe fn refill(&self, inner: &mut SlabInner, page: NonNull<u8>) {
        let header = page.cast::<PageHeader>();
        unsafe { (*header.as_ptr()).next = inner.pages };
        inner.pages = Some(header);

        let first_obj = align_up(size_of::<PageHeader>(), OBJ_ALIGN);
        let count = (PAGE_SIZE - first_obj) / self.obj_size;

        let base = page.as_ptr() as usize + first_obj;
        for i in 0..count {
            let obj = (base + i * self.obj_size) as *mut FreeObj;
            unsafe { (*obj).next = inner.free };
            inner.free = NonNull::new(obj);
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::PAGE_BITS;
    use std::alloc::{alloc, Layout};
    use std::collections::BTreeSet;

    const POOL_PAGES: usize = 16;

    fn pool() -> (BuddyAllocator, Quota) {
        let layout = Layout::from_size_align(POOL_PAGES * PAGE_SIZE, PAGE_SIZE).unwrap();
        let base = unsafe { alloc(layout) };
        assert!(!base.is_null());

        let buddy = BuddyAllocator::new();
        unsafe { buddy.init(base, POOL_PAGES << PAGE_BITS) };
        (buddy, Quota::new(POOL_PAGES))
    }

    #[test]
    fn objects_are_distinct_and_reused() {
        let (buddy, quota) = pool();
        let cache = SlabCache::new(48);

        let a = cache.alloc(&buddy, &quota).unwrap();
        let b = cache.alloc(&buddy, &quota).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_eq!(quota.used(), 1, "one page backs both objects");

        unsafe { cache.free(a) };
        let c = cache.alloc(&buddy, &quota).unwrap();
        assert_eq!(a.as_ptr(), c.as_ptr(), "freed object is reused first");

        unsafe {
            cache.free(b);
            cache.free(c);
            cache.destroy(&buddy, &quota);
        }
        assert_eq!(quota.used(), 0);
    }

    #[test]
    fn refill_spans_multiple_pages() {
        let (buddy, quota) = pool();
        let cache = SlabCache::new(256);

        let per_page = (PAGE_SIZE - 16) / cache.obj_size();
        let mut objs = BTreeSet::new();

        for _ in 0..per_page + 1 {
            let obj = cache.alloc(&buddy, &quota).unwrap();
            assert!(objs.insert(obj.as_ptr() as usize));
        }

        assert_eq!(quota.used(), 2);

        for obj in &objs {
            unsafe { cache.free(NonNull::new(*obj as *mut u8).unwrap()) };
        }
        unsafe { cache.destroy(&buddy, &quota) };
        assert_eq!(quota.used(), 0);
    }

    #[test]
    fn exhausted_quota_stops_refill() {
        let (buddy, _) = pool();
        let quota = Quota::new(1);
        // Only one object of this size fits on a page.
        let cache = SlabCache::new(PAGE_SIZE / 2);

        assert!(cache.alloc(&buddy, &quota).is_some());
        assert_eq!(quota.used(), 1);
        assert!(cache.alloc(&buddy, &quota).is_none(), "refill must fail on an exhausted quota");
    }
}
