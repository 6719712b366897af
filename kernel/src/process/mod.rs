/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: process                                                         ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Kernel objects: protection domains, execution contexts,         ║
   ║         scheduling contexts, portals and semaphores. All of them are    ║
   ║         reference counted, allocated from their domain's slab caches    ║
   ║         and reclaimed through RCU.                                      ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, HHU                                             ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
pub mod ec;
pub mod pd;
pub mod pt;
pub mod sc;
pub mod sm;

use crate::rcu::RcuHead;
use core::sync::atomic::Ordering::SeqCst;
use core::sync::atomic::{AtomicBool, AtomicUsize};
use spin::Mutex;

/// Common head of every kernel object: RCU linkage, reference count and
/// the object lock guarding auxiliary bookkeeping.
pub struct Kobject {
    pub rcu: RcuHead,
    ref_count: AtomicUsize,
    dying: AtomicBool,
    pub lock: Mutex<()>,
}

impl Kobject {
    pub fn new(obj: *mut (), free: unsafe fn(*mut ())) -> Self {
        Self {
            rcu: RcuHead::new(obj, free),
            ref_count: AtomicUsize::new(1),
            dying: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }

    /// Flag the object as dying; true for exactly one caller. Keeps the
    /// teardown hooks from running twice when capability revocation and
    /// domain destruction overlap.
    pub fn mark_dying(&self) -> bool {
        !self.dying.swap(true, SeqCst)
    }

    /// Take a reference; fails once the object is dying.
    pub fn add_ref(&self) -> bool {
        let mut count = self.ref_count.load(SeqCst);

        loop {
            if count == 0 {
                return false;
            }

            match self.ref_count.compare_exchange(count, count + 1, SeqCst, SeqCst) {
                Ok(_) => return true,
                Err(current) => count = current,
            }
        }
    }

    /// Drop a reference; true iff this was the last one.
    pub fn del_ref(&self) -> bool {
        let previous = self.ref_count.fetch_sub(1, SeqCst);
        assert!(previous > 0, "kernel object reference count underflow");
        previous == 1
    }

    /// Drop a reference on behalf of a queue the object leaves. True iff
    /// the caller must hand the object to RCU.
    pub fn del_rcu(&self) -> bool {
        self.del_ref()
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(SeqCst)
    }
}
