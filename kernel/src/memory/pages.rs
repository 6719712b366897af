/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: pages                                                           ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Shadow page tables. One Pgt instance backs each replica a memory        ║
   ║ space maintains: the host table, the per-CPU copies, the guest          ║
   ║ (NPT/EPT) table and the IOMMU (DMAR/IR) tables.                         ║
   ║   - update     install or strip one naturally aligned chunk            ║
   ║   - check      can the quota fund the tables for one more chunk        ║
   ║   - lookup     translate a page number to (frame, flags)               ║
   ║   - clear      free all tables back to the buddy                       ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, Univ. Duesseldorf                               ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::memory::pool;
use core::ptr;
use core::ptr::NonNull;
use mm::{BuddyAllocator, Quota, PAGE_BITS, PAGE_SIZE};
use spin::Mutex;
use x86_64::structures::paging::{PageTable, PageTableFlags};
use x86_64::PhysAddr;

/// Index bits per table level.
pub const TABLE_ORDER: usize = 9;

/// How an update is applied.
#[derive(Copy, Clone, Eq, PartialEq)]
pub enum UpdateOp {
    /// Install entries (delegation).
    Install,
    /// Reduce or remove entries (revocation).
    Strip,
    /// Overwrite entries on a replica without reporting changes.
    Mirror,
}

/// A radix page table of `levels` levels, updated in naturally aligned
/// chunks of up to `2^max_ord` pages.
pub struct Pgt {
    levels: usize,
    max_ord: usize,
    root: Mutex<Option<NonNull<PageTable>>>,
}

unsafe impl Send for Pgt {}
unsafe impl Sync for Pgt {}

impl Pgt {
    pub const fn new(levels: usize, max_ord: usize) -> Self {
        Self {
            levels,
            max_ord,
            root: Mutex::new(None),
        }
    }

    pub fn max_ord(&self) -> usize {
        self.max_ord
    }

    /// A table is active once it has a root. Inactive per-CPU replicas are
    /// skipped during updates.
    pub fn active(&self) -> bool {
        self.root.lock().is_some()
    }

    /// Root the table without installing anything yet.
    pub fn activate(&self, quota: &Quota, buddy: &BuddyAllocator) -> bool {
        let mut root = self.root.lock();
        if root.is_some() {
            return true;
        }

        match Self::new_table(buddy, quota) {
            Some(table) => {
                *root = Some(table);
                true
            }
            None => false,
        }
    }

    /// Can `quota` fund the intermediate tables one more chunk may need?
    pub fn check(&self, quota: &Quota, _ord: usize) -> bool {
        !quota.hit_limit(self.levels)
    }

    /// Install, strip or mirror one chunk of `1 << order` pages starting at
    /// page number `base`, mapped to frame number `phys`. Returns true iff
    /// any entry changed.
    pub fn update(
        &self,
        quota: &Quota,
        buddy: &BuddyAllocator,
        base: usize,
        order: usize,
        phys: usize,
        attr: PageTableFlags,
        op: UpdateOp,
    ) -> bool {
        assert!(order <= self.max_ord);
        assert_eq!(base & ((1 << order) - 1), 0, "chunk base not aligned to its order");

        let mut root = self.root.lock();
        if root.is_none() {
            if op == UpdateOp::Strip || attr.is_empty() {
                return false;
            }

            match Self::new_table(buddy, quota) {
                Some(table) => *root = Some(table),
                None => return false,
            }
        }

        let mut table_ptr = root.unwrap();
        let table = unsafe { table_ptr.as_mut() };
        let changed = Self::update_in_table(table, self.levels, buddy, quota, base, order, phys, attr, op);

        match op {
            UpdateOp::Mirror => false,
            _ => changed,
        }
    }

    /// Translate page number `base`.
    pub fn lookup(&self, base: usize) -> Option<(usize, PageTableFlags)> {
        let root = self.root.lock();
        let mut table = unsafe { (*root)?.as_ref() };

        for level in (2..=self.levels).rev() {
            let index = (base >> (TABLE_ORDER * (level - 1))) & 0x1ff;
            let entry = &table[index];
            if entry.is_unused() {
                return None;
            }

            table = unsafe { (entry.addr().as_u64() as *const PageTable).as_ref().unwrap() };
        }

        let entry = &table[base & 0x1ff];
        if entry.is_unused() {
            return None;
        }

        Some(((entry.addr().as_u64() as usize) >> PAGE_BITS, entry.flags()))
    }

    /// Free every table back to the buddy, crediting `quota`.
    pub fn clear(&self, quota: &Quota, buddy: &BuddyAllocator) {
        let mut root = self.root.lock();
        if let Some(table) = root.take() {
            unsafe { Self::drop_table(table.as_ptr(), self.levels, buddy, quota) };
        }
    }

    fn update_in_table(
        table: &mut PageTable,
        level: usize,
        buddy: &BuddyAllocator,
        quota: &Quota,
        base: usize,
        order: usize,
        phys: usize,
        attr: PageTableFlags,
        op: UpdateOp,
    ) -> bool {
        if level > 1 {
            // An aligned chunk of order <= TABLE_ORDER nests inside exactly
            // one entry of every upper level.
            let index = (base >> (TABLE_ORDER * (level - 1))) & 0x1ff;
            let entry = &mut table[index];

            let next_level_table;
            if entry.is_unused() {
                if op == UpdateOp::Strip || attr.is_empty() {
                    return false;
                }

                let Some(table) = Self::new_table(buddy, quota) else {
                    return false;
                };
                entry.set_addr(
                    PhysAddr::new(table.as_ptr() as u64),
                    PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
                );
                next_level_table = unsafe { &mut *table.as_ptr() };
            } else {
                next_level_table = unsafe { (entry.addr().as_u64() as *mut PageTable).as_mut().unwrap() };
            }

            return Self::update_in_table(next_level_table, level - 1, buddy, quota, base, order, phys, attr, op);
        }

        // Reached the leaf table.
        let start = base & 0x1ff;
        let mut changed = false;

        for i in 0..1 << order {
            let entry = &mut table[start + i];

            if attr.is_empty() {
                if !entry.is_unused() {
                    entry.set_unused();
                    changed = true;
                }
            } else {
                let addr = PhysAddr::new(((phys + i) << PAGE_BITS) as u64);
                if entry.is_unused() || entry.addr() != addr || entry.flags() != attr {
                    entry.set_addr(addr, attr);
                    changed = true;
                }
            }
        }

        changed
    }

    fn new_table(buddy: &BuddyAllocator, quota: &Quota) -> Option<NonNull<PageTable>> {
        let page = buddy.alloc(quota, 0)?;
        unsafe { ptr::write_bytes(page.as_ptr(), 0, PAGE_SIZE) };
        Some(page.cast())
    }

    unsafe fn drop_table(table: *mut PageTable, level: usize, buddy: &BuddyAllocator, quota: &Quota) {
        if level > 1 {
            for entry in unsafe { (*table).iter() } {
                if entry.is_unused() {
                    continue;
                }

                unsafe { Self::drop_table(entry.addr().as_u64() as *mut PageTable, level - 1, buddy, quota) };
            }
        }

        unsafe { buddy.free(quota, NonNull::new_unchecked(table as *mut u8), 0) };
    }
}

/// Translate mapping attributes to hardware page table flags. `sub_wt`
/// adds the write-through hint carried in the mapping's sub flags.
pub fn hw_attr(attr: usize, sub_wt: bool) -> PageTableFlags {
    if attr == 0 {
        return PageTableFlags::empty();
    }

    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;

    if attr & syscall::crd::MemAttr::WRITE.bits() != 0 {
        flags |= PageTableFlags::WRITABLE;
    }

    if attr & syscall::crd::MemAttr::EXEC.bits() == 0 {
        flags |= PageTableFlags::NO_EXECUTE;
    }

    if sub_wt {
        flags |= PageTableFlags::WRITE_THROUGH;
    }

    flags
}

/// Allocate one zeroed page from the pool for bookkeeping purposes
/// (e.g. saved IOAPIC redirection entries).
pub fn alloc_page(quota: &Quota) -> Option<NonNull<u8>> {
    let page = pool::buddy().alloc(quota, 0)?;
    unsafe { ptr::write_bytes(page.as_ptr(), 0, PAGE_SIZE) };
    Some(page)
}

pub unsafe fn free_page(quota: &Quota, page: NonNull<u8>) {
    unsafe { pool::buddy().free(quota, page, 0) };
}
