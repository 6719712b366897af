/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: mdb                                                             ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Mapping database nodes. Every delegation of a capability range is       ║
   ║ recorded as one node. Nodes of one derivation tree are linked into a    ║
   ║ depth-first traversal ring (prev/next), so revocation can sweep a       ║
   ║ whole subtree without recursion; each resource space additionally       ║
   ║ indexes its live nodes by base address.                                 ║
   ║                                                                         ║
   ║ Lifecycle: nodes are created by delegation, unlinked by revocation      ║
   ║ and freed through RCU. tree_remove and remove_node each have exactly    ║
   ║ one winner, which is the only caller allowed to defer the free.         ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, Univ. Duesseldorf                               ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::memory::pool;
use crate::process::pd::Pd;
use crate::rcu;
use crate::rcu::RcuHead;
use crate::space::space_obj::CapObj;
use crate::space::SpaceKind;
use alloc::collections::BTreeMap;
use core::ptr::NonNull;
use core::sync::atomic::Ordering::SeqCst;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize};
use spin::Mutex;

/// One spinlock per space kind serializes ring splices. Attribute
/// mutation is serialized per node by `node_lock`.
static RING_LOCKS: [Mutex<()>; 3] = [const { Mutex::new(()) }; 3];

fn ring_lock(kind: SpaceKind) -> &'static Mutex<()> {
    &RING_LOCKS[kind as usize]
}

pub struct Mdb {
    pub rcu: RcuHead,
    pd: NonNull<Pd>,
    kind: SpaceKind,

    pub node_base: usize,
    pub node_order: usize,
    pub node_phys: usize,
    node_attr: AtomicUsize,
    pub node_sub: usize,
    pub node_type: u32,
    pub dpth: u16,

    prnt: AtomicPtr<Mdb>,
    prev: AtomicPtr<Mdb>,
    next: AtomicPtr<Mdb>,

    /// Serializes attribute mutation against shadow-table replication.
    pub node_lock: Mutex<()>,

    linked: AtomicBool,
    in_tree: AtomicBool,

    /// Set on the root node of an object-space derivation tree; the root
    /// is created together with the kernel object it names.
    pub object: Option<CapObj>,
}

unsafe impl Send for Mdb {}
unsafe impl Sync for Mdb {}

/// RCU callback: drop the object reference a root node holds, then return
/// the node to its domain's slab cache.
unsafe fn free_mdb(obj: *mut ()) {
    let node = obj as *mut Mdb;
    unsafe {
        if let Some(object) = (*node).object {
            crate::space::space_obj::object_release(object);
        }

        let pd = (*node).pd();
        pd.mdb_cache.free(NonNull::new_unchecked(node as *mut u8));
    }
}

impl Mdb {
    /// Allocate a node from the owning domain's mdb cache. Returns None if
    /// the domain's quota cannot fund it.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        pd: &Pd,
        kind: SpaceKind,
        phys: usize,
        base: usize,
        order: usize,
        attr: usize,
        typ: u32,
        sub: usize,
        dpth: u16,
        object: Option<CapObj>,
    ) -> Option<NonNull<Mdb>> {
        let raw = pd.mdb_cache.alloc(pool::buddy(), &pd.quota)?.cast::<Mdb>();

        let node = Mdb {
            rcu: RcuHead::new(raw.as_ptr() as *mut (), free_mdb),
            pd: NonNull::from(pd),
            kind,
            node_base: base,
            node_order: order,
            node_phys: phys,
            node_attr: AtomicUsize::new(attr),
            node_sub: sub,
            node_type: typ,
            dpth,
            prnt: AtomicPtr::new(core::ptr::null_mut()),
            prev: AtomicPtr::new(raw.as_ptr()),
            next: AtomicPtr::new(raw.as_ptr()),
            node_lock: Mutex::new(()),
            linked: AtomicBool::new(true),
            in_tree: AtomicBool::new(false),
            object,
        };

        unsafe { raw.as_ptr().write(node) };
        Some(raw)
    }

    /// Free a node that never became visible (tree insertion failed).
    pub unsafe fn destroy(node: NonNull<Mdb>) {
        unsafe {
            let pd = node.as_ref().pd();
            pd.mdb_cache.free(node.cast());
        }
    }

    pub fn pd(&self) -> &Pd {
        unsafe { self.pd.as_ref() }
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    pub fn attr(&self) -> usize {
        self.node_attr.load(SeqCst)
    }

    pub fn prnt(&self) -> Option<NonNull<Mdb>> {
        NonNull::new(self.prnt.load(SeqCst))
    }

    pub fn next_ptr(&self) -> NonNull<Mdb> {
        NonNull::new(self.next.load(SeqCst)).unwrap()
    }

    pub fn prev_ptr(&self) -> NonNull<Mdb> {
        NonNull::new(self.prev.load(SeqCst)).unwrap()
    }

    /// Is the node still spliced into its traversal ring?
    pub fn linked(&self) -> bool {
        self.linked.load(SeqCst)
    }

    /// Clear `mask` from the node's attributes. Cascades over a subtree
    /// are driven by the revocation engine, not here.
    pub fn demote_node(&self, mask: usize) {
        let _guard = self.node_lock.lock();
        self.node_attr.fetch_and(!mask, SeqCst);
    }

    /// Wire this node into the traversal ring behind `parent`'s last
    /// descendant and clamp its attributes to the parent's. Fails if the
    /// parent has been demoted or unlinked concurrently.
    pub fn insert_node(&self, parent: NonNull<Mdb>, attr: usize) -> bool {
        let _ring = ring_lock(self.kind).lock();

        let p = unsafe { parent.as_ref() };
        let clamped = attr & p.attr();
        if clamped == 0 || !p.linked.load(SeqCst) {
            return false;
        }

        self.node_attr.store(clamped, SeqCst);
        self.prnt.store(parent.as_ptr(), SeqCst);

        // The parent's descendants form a contiguous arc behind it; the
        // new node goes after the last of them.
        let mut tail = parent;
        loop {
            let next = unsafe { tail.as_ref() }.next_ptr();
            if unsafe { next.as_ref() }.dpth <= p.dpth {
                break;
            }
            tail = next;
        }

        let tail_next = unsafe { tail.as_ref() }.next_ptr();
        let self_ptr = self as *const Mdb as *mut Mdb;

        self.prev.store(tail.as_ptr(), SeqCst);
        self.next.store(tail_next.as_ptr(), SeqCst);
        unsafe {
            tail.as_ref().next.store(self_ptr, SeqCst);
            tail_next.as_ref().prev.store(self_ptr, SeqCst);
        }

        self.linked.store(true, SeqCst);
        true
    }

    /// Splice the node out of its ring. Returns true iff this call was the
    /// last unlink, i.e. the caller may hand the node to RCU after also
    /// winning the tree removal. Nodes that still carry attributes stay;
    /// with `force` false, nodes that still have descendants stay as well
    /// (the "keep in mapping database" case).
    pub fn remove_node(&self, force: bool) -> bool {
        let _ring = ring_lock(self.kind).lock();

        if self.attr() != 0 {
            return false;
        }

        if !self.linked.load(SeqCst) {
            return false;
        }

        if !force && unsafe { self.next_ptr().as_ref() }.dpth > self.dpth {
            return false;
        }

        // The node's own links stay intact so that a concurrent sweep
        // holding it can still walk off of it.
        let prev = self.prev_ptr();
        let next = self.next_ptr();

        unsafe {
            prev.as_ref().next.store(next.as_ptr(), SeqCst);
            next.as_ref().prev.store(prev.as_ptr(), SeqCst);
        }

        self.linked.store(false, SeqCst);
        true
    }
}

/// Handle stored in the per-space index.
#[derive(Copy, Clone)]
pub struct MdbPtr(pub NonNull<Mdb>);

unsafe impl Send for MdbPtr {}
unsafe impl Sync for MdbPtr {}

/// Address-ordered index of the live nodes of one resource space. No two
/// live nodes of one space overlap.
pub struct MdbTree {
    map: BTreeMap<usize, MdbPtr>,
}

impl MdbTree {
    pub const fn new() -> Self {
        Self { map: BTreeMap::new() }
    }

    /// Find the live node covering `addr`. With `next`, the node with the
    /// smallest base above `addr` is returned instead when no node covers
    /// it; the delegation and revocation walks advance through a space
    /// this way.
    pub fn lookup(&self, addr: usize, next: bool) -> Option<NonNull<Mdb>> {
        if let Some((&base, node)) = self.map.range(..=addr).next_back() {
            let order = unsafe { node.0.as_ref() }.node_order;
            if addr < base + (1 << order) {
                return Some(node.0);
            }
        }

        if next {
            return self.map.range(addr..).next().map(|(_, node)| node.0);
        }

        None
    }

    /// Insert a node; fails if its range overlaps any live node.
    pub fn insert(&mut self, node: NonNull<Mdb>) -> bool {
        let mdb = unsafe { node.as_ref() };
        let base = mdb.node_base;
        let end = base + (1 << mdb.node_order);

        if let Some((&other_base, other)) = self.map.range(..end).next_back() {
            let other_end = other_base + (1 << unsafe { other.0.as_ref() }.node_order);
            if other_base >= base || other_end > base {
                return false;
            }
        }

        mdb.in_tree.store(true, SeqCst);
        self.map.insert(base, MdbPtr(node));
        true
    }

    /// Remove a node. Returns true iff this caller actually removed it;
    /// concurrent removers lose and must not free the node.
    pub fn remove(&mut self, node: NonNull<Mdb>) -> bool {
        let mdb = unsafe { node.as_ref() };

        if !mdb.in_tree.swap(false, SeqCst) {
            return false;
        }

        let removed = self.map.remove(&mdb.node_base);
        debug_assert!(removed.map(|n| n.0 == node).unwrap_or(false));
        true
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Defer a node's reclamation past the current grace period. Only the
/// caller that won both `remove_node` and `tree_remove` may do this.
pub fn call_rcu(node: NonNull<Mdb>) {
    rcu::call(unsafe { &node.as_ref().rcu });
}
