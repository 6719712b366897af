/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: delegate_tests                                                  ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: End-to-end delegation and revocation: shadow table              ║
   ║         consistency, partial-range revocation, idempotent               ║
   ║         re-delegation and quota exhaustion mid-transfer.                ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Michael Schoettner, HHU                                         ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::device::cpu;
use crate::device::cpu::HZD_OOM;
use crate::memory::pool;
use crate::process::pd;
use crate::process::pd::Pd;
use crate::rcu;
use crate::space::space_mem::SpaceMem;
use crate::space::space_pio::SpacePio;
use crate::space::Space;
use log::info;
use syscall::crd::{ATTR_FULL, MemAttr, PIO_ACCESS};
use x86_64::structures::paging::PageTableFlags;

fn new_pd(limit: usize) -> &'static Pd {
    let pd = Pd::create(pd::root(), limit).expect("failed to create a test domain");
    unsafe { &*pd.as_ptr() }
}

pub fn run() {
    test_delegate_then_revoke();
    test_partial_range_revoke();
    test_idempotent_redelegation();
    test_oom_mid_delegation();
    test_pio_delegation();
    test_translate();
    test_iommu_flush_on_revoke();

    info!("   test 'delegate': passed");
}

/// Delegate a write mapping, check the host table, revoke it again.
fn test_delegate_then_revoke() {
    let a = new_pd(32);
    let root = pd::root();
    let base = pool::base_page() + 0x100;

    assert!(a.delegate::<SpaceMem>(root, base, base, 4, MemAttr::WRITE.bits(), 0));

    let node = SpaceMem::of(a).tree().read().lookup(base, false).expect("mapping missing");
    let mdb = unsafe { node.as_ref() };
    assert_eq!(mdb.node_base, base);
    assert_eq!(mdb.node_order, 4);
    assert_eq!(mdb.attr(), MemAttr::WRITE.bits());

    for page in base..base + 16 {
        let (frame, flags) = a.mem.hpt_lookup(page).expect("host table entry missing");
        assert_eq!(frame, page);
        assert!(flags.contains(PageTableFlags::PRESENT | PageTableFlags::WRITABLE));
    }

    // Revoking from the parent domain removes the child mapping without
    // touching the parent's own.
    root.revoke::<SpaceMem>(base, 4, ATTR_FULL, false, false);

    assert!(SpaceMem::of(a).tree().read().lookup(base, false).is_none());
    for page in base..base + 16 {
        assert!(a.mem.hpt_lookup(page).is_none());
        assert!(root.mem.hpt_lookup(page).is_some());
    }

    rcu::quiet();
    assert_eq!(rcu::pending(), 0);
}

/// Revoking an inner window removes the intersecting child node while the
/// parent's mapping over the rest of the range survives.
fn test_partial_range_revoke() {
    let a = new_pd(32);
    let root = pd::root();
    let base = pool::base_page() + 0x200;

    assert!(a.delegate::<SpaceMem>(root, base, base, 8, ATTR_FULL, 0));
    root.revoke::<SpaceMem>(base + 0x10, 4, ATTR_FULL, false, false);

    // The order-8 child intersected the window and is gone.
    assert!(SpaceMem::of(a).tree().read().lookup(base, false).is_none());
    assert!(a.mem.hpt_lookup(base).is_none());

    // The parent still maps the whole range.
    let parent = root.mem.hpt_lookup(base + 0x80);
    assert!(parent.is_some());

    rcu::quiet();
}

/// Applying the same delegation twice yields the same mappings; the
/// second run is a silent skip.
fn test_idempotent_redelegation() {
    let a = new_pd(32);
    let root = pd::root();
    let base = pool::base_page() + 0x300;

    assert!(a.delegate::<SpaceMem>(root, base, base, 4, MemAttr::WRITE.bits(), 0));
    let len = SpaceMem::of(a).tree().read().len();

    assert!(!a.delegate::<SpaceMem>(root, base, base, 4, MemAttr::WRITE.bits(), 0));
    assert_eq!(SpaceMem::of(a).tree().read().len(), len);

    let node = SpaceMem::of(a).tree().read().lookup(base, false).unwrap();
    assert_eq!(unsafe { node.as_ref() }.attr(), MemAttr::WRITE.bits());
}

/// A quota too small for the shadow tables aborts the transfer with the
/// OOM hazard; the partially installed node is unwound.
fn test_oom_mid_delegation() {
    let b = new_pd(6);
    let root = pd::root();
    let base = pool::base_page() + 0x400;

    cpu::clr_hazard(HZD_OOM);
    b.delegate::<SpaceMem>(root, base, base, 10, ATTR_FULL, 0);

    assert!(cpu::chk_hazard(HZD_OOM), "quota exhaustion must raise the OOM hazard");
    cpu::clr_hazard(HZD_OOM);

    // The aborted node was demoted and unlinked again.
    assert!(SpaceMem::of(b).tree().read().lookup(base, false).is_none());

    rcu::quiet();
}

/// Capability translation finds the ancestor mapping in the receiving
/// domain and clamps it into the translate window.
fn test_translate() {
    let a = new_pd(32);
    let root = pd::root();
    let base = pool::base_page() + 0x500;

    assert!(a.delegate::<SpaceMem>(root, base, base, 4, ATTR_FULL, 0));

    let mut crd = syscall::Crd::new(syscall::CrdKind::Mem, base, 2, ATTR_FULL);
    let window = syscall::Crd::new(syscall::CrdKind::Mem, base, 4, ATTR_FULL);
    root.xlt_crd(a, window, &mut crd);

    assert_eq!(crd.kind(), syscall::CrdKind::Mem);
    assert_eq!(crd.base(), base);
    assert_eq!(crd.order(), 2);

    // A mismatched kind translates to the null capability.
    let mut crd = syscall::Crd::new(syscall::CrdKind::Pio, base, 2, ATTR_FULL);
    root.xlt_crd(a, window, &mut crd);
    assert_eq!(crd.kind(), syscall::CrdKind::Null);
}

/// Revoking an IOMMU-visible mapping flushes the IOMMU page tables of
/// every requester id bound to the revoking domain.
fn test_iommu_flush_on_revoke() {
    let a = new_pd(32);
    let root = pd::root();
    let base = pool::base_page() + 0x600;

    a.assign_rid(0x42);
    assert!(a.delegate::<SpaceMem>(root, base, base, 2, ATTR_FULL, 0x1));

    let flushes = crate::device::iommu::flush_count();
    a.revoke::<SpaceMem>(base, 2, ATTR_FULL, true, false);

    assert!(crate::device::iommu::flush_count() > flushes, "revocation must reach the IOMMU layer");
    assert!(SpaceMem::of(a).tree().read().lookup(base, false).is_none());

    rcu::quiet();
}

/// Port delegation drives the I/O permission bitmap.
fn test_pio_delegation() {
    let a = new_pd(32);
    let root = pd::root();

    assert!(!a.pio.lookup(0x3f8));
    a.delegate::<SpacePio>(root, 0x3f8, 0x3f8, 3, PIO_ACCESS, 0);
    assert!(a.pio.lookup(0x3f8));
    assert!(a.pio.lookup(0x3ff));
    assert!(!a.pio.lookup(0x400));

    root.revoke::<SpacePio>(0x3f8, 3, PIO_ACCESS, false, false);
    assert!(!a.pio.lookup(0x3f8));

    rcu::quiet();
}
