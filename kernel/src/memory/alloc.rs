/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: alloc                                                           ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Kernel heap, backing the alloc crate (Vec, VecDeque, BTreeMap). ║
   ║         Not for kernel objects; those come from the per-domain slab     ║
   ║         caches and are charged against quotas.                          ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, HHU                                             ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};
use linked_list_allocator::Heap;
use spin::Mutex;

pub struct KernelAllocator {
    heap: Mutex<Heap>,
    initialized: AtomicBool,
}

impl KernelAllocator {
    pub const fn new() -> Self {
        Self {
            heap: Mutex::new(Heap::empty()),
            initialized: AtomicBool::new(false),
        }
    }

    pub unsafe fn init(&self, start: *mut u8, size: usize) {
        unsafe { self.heap.lock().init(start, size) };
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }
}

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.heap
            .lock()
            .allocate_first_fit(layout)
            .map(|block| block.as_ptr())
            .unwrap_or(ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe {
            self.heap
                .lock()
                .deallocate(core::ptr::NonNull::new_unchecked(ptr), layout)
        };
    }
}
