/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: mdb_tests                                                       ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Mapping database invariants: tree lookup/insert/remove,         ║
   ║         the depth-first traversal ring, attribute clamping along the    ║
   ║         delegation chain and exactly-once removal.                      ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Michael Schoettner, HHU                                         ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::cap::mdb;
use crate::cap::mdb::Mdb;
use crate::memory::pool;
use crate::process::pd;
use crate::process::pd::Pd;
use crate::rcu;
use crate::space::space_mem::SpaceMem;
use crate::space::Space;
use core::ptr::NonNull;
use log::info;
use syscall::crd::{ATTR_FULL, MemAttr};

fn new_pd(limit: usize) -> &'static Pd {
    let pd = Pd::create(pd::root(), limit).expect("failed to create a test domain");
    unsafe { &*pd.as_ptr() }
}

fn mem_node(pd: &Pd, base: usize) -> Option<NonNull<Mdb>> {
    SpaceMem::of(pd).tree().read().lookup(base, false)
}

pub fn run() {
    test_tree_ops();
    test_ring_dfs();
    test_attr_clamp();
    test_remove_once();

    info!("   test 'mdb':      passed");
}

fn test_tree_ops() {
    let a = new_pd(32);
    let root = pd::root();
    let base = pool::base_page() + 0x10;

    assert!(a.delegate::<SpaceMem>(root, base, base, 4, ATTR_FULL, 0));

    // Covering lookup anywhere inside the range, none outside.
    let node = mem_node(a, base + 7).expect("mapping not found");
    let mdb = unsafe { node.as_ref() };
    assert_eq!(mdb.node_base, base);
    assert_eq!(mdb.node_order, 4);
    assert!(mem_node(a, base + 16).is_none());
    assert!(mem_node(a, base - 1).is_none());

    // The partial lookup continues at the next node above a hole.
    let next = SpaceMem::of(a).tree().read().lookup(base - 1, true).expect("partial lookup failed");
    assert_eq!(next, node);

    // A second delegation overlapping the range from a different source
    // node is refused and leaves the tree unchanged.
    let len = SpaceMem::of(a).tree().read().len();
    assert!(!a.delegate::<SpaceMem>(root, base + 4, base + 4, 2, ATTR_FULL, 0));
    assert_eq!(SpaceMem::of(a).tree().read().len(), len);
}

fn test_ring_dfs() {
    let a = new_pd(32);
    let b = new_pd(32);
    let c = new_pd(32);
    let root = pd::root();
    let base = pool::base_page() + 0x40;

    assert!(a.delegate::<SpaceMem>(root, base, base, 4, ATTR_FULL, 0));
    assert!(b.delegate::<SpaceMem>(a, base, base, 2, ATTR_FULL, 0));
    assert!(c.delegate::<SpaceMem>(a, base + 4, base + 4, 2, ATTR_FULL, 0));

    let a_node = mem_node(a, base).unwrap();
    let b_node = mem_node(b, base).unwrap();
    let c_node = mem_node(c, base + 4).unwrap();

    let a_ref = unsafe { a_node.as_ref() };
    assert_eq!(unsafe { b_node.as_ref() }.dpth, a_ref.dpth + 1);
    assert_eq!(unsafe { c_node.as_ref() }.dpth, a_ref.dpth + 1);

    // Walking next from a node visits exactly its descendants before
    // falling back to depth <= its own.
    let mut walk = a_ref.next_ptr();
    let mut descendants = alloc::vec::Vec::new();
    while unsafe { walk.as_ref() }.dpth > a_ref.dpth {
        descendants.push(walk);
        walk = unsafe { walk.as_ref() }.next_ptr();
    }

    assert_eq!(descendants.len(), 2);
    assert_eq!(descendants[0], b_node);
    assert_eq!(descendants[1], c_node);
}

fn test_attr_clamp() {
    let a = new_pd(32);
    let b = new_pd(32);
    let root = pd::root();
    let base = pool::base_page() + 0x60;

    // A only gets write; whatever B asks for is clamped to that.
    assert!(a.delegate::<SpaceMem>(root, base, base, 2, MemAttr::WRITE.bits(), 0));
    assert!(b.delegate::<SpaceMem>(a, base, base, 2, ATTR_FULL, 0));

    let a_node = unsafe { mem_node(a, base).unwrap().as_ref() };
    let b_node = unsafe { mem_node(b, base).unwrap().as_ref() };

    assert_eq!(a_node.attr(), MemAttr::WRITE.bits());
    assert_eq!(b_node.attr(), MemAttr::WRITE.bits());
    assert_eq!(b_node.attr() & !a_node.attr(), 0);
    assert_eq!(b_node.prnt(), mem_node(a, base));
}

fn test_remove_once() {
    let a = new_pd(32);
    let root = pd::root();
    let base = pool::base_page() + 0x80;

    assert!(a.delegate::<SpaceMem>(root, base, base, 0, ATTR_FULL, 0));
    let node = mem_node(a, base).unwrap();
    let mdb = unsafe { node.as_ref() };

    // A node still carrying rights stays linked.
    assert!(!mdb.remove_node(true));

    mdb.demote_node(ATTR_FULL);

    // Exactly one caller wins each removal phase.
    assert!(mdb.remove_node(true));
    assert!(!mdb.remove_node(true));

    assert!(SpaceMem::of(a).tree().write().remove(node));
    assert!(!SpaceMem::of(a).tree().write().remove(node));

    mdb::call_rcu(node);
    rcu::quiet();
    rcu::quiet();
    assert_eq!(rcu::pending(), 0);
}
