/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: space_obj                                                       ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Object space of a protection domain. The shadow structure is the        ║
   ║ selector -> capability table consulted by every system call. The root   ║
   ║ node of an object derivation tree is created together with the kernel   ║
   ║ object it names; revoking it tears the object down.                     ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, Univ. Duesseldorf                               ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::cap::mdb::{Mdb, MdbTree};
use crate::process::ec::Ec;
use crate::process::pd::Pd;
use crate::process::pt::Pt;
use crate::process::sc::Sc;
use crate::process::sm::Sm;
use crate::process::{ec, pd, pt, sc, sm};
use crate::space::{Space, SpaceKind};
use alloc::collections::BTreeMap;
use core::ptr::NonNull;
use spin::RwLock;

/// Reference to a kernel object held by a capability.
#[derive(Copy, Clone)]
pub enum CapObj {
    Pd(NonNull<Pd>),
    Ec(NonNull<Ec>),
    Sc(NonNull<Sc>),
    Pt(NonNull<Pt>),
    Sm(NonNull<Sm>),
}

unsafe impl Send for CapObj {}
unsafe impl Sync for CapObj {}

#[derive(Copy, Clone)]
pub struct Capability {
    pub obj: CapObj,
    pub attr: usize,
}

pub struct SpaceObj {
    tree: RwLock<MdbTree>,
    caps: RwLock<BTreeMap<usize, Capability>>,
}

impl SpaceObj {
    pub const fn new() -> Self {
        Self {
            tree: RwLock::new(MdbTree::new()),
            caps: RwLock::new(BTreeMap::new()),
        }
    }

    /// Capability lookup on the system call path.
    pub fn lookup(&self, sel: usize) -> Option<Capability> {
        self.caps.read().get(&sel).copied()
    }

    /// Create the root node and capability for a freshly created kernel
    /// object at selector `sel`. Fails if the selector range is occupied
    /// or the quota cannot fund the node.
    pub fn insert_root(&self, pd: &Pd, sel: usize, attr: usize, obj: CapObj) -> bool {
        let Some(node) = Mdb::create(pd, SpaceKind::Obj, sel, sel, 0, attr, 0, 0, 0, Some(obj)) else {
            return false;
        };

        if !self.tree.write().insert(node) {
            unsafe { Mdb::destroy(node) };
            return false;
        }

        self.caps.write().insert(sel, Capability { obj, attr });
        true
    }
}

/// Find the object a node derives from by walking to the root of its
/// derivation tree.
fn resolve_obj(mdb: &Mdb) -> Option<CapObj> {
    let mut node = mdb;

    loop {
        if let Some(obj) = node.object {
            return Some(obj);
        }

        let parent = node.prnt()?;
        node = unsafe { parent.as_ref() };
    }
}

/// Tear-down hook, invoked synchronously when an object's root capability
/// loses its last rights: scheduling contexts get descheduled, semaphores
/// drain their waiters, domains revoke everything they hold. Runs once
/// per object, even when teardown paths overlap.
fn pre_free(obj: CapObj) {
    match obj {
        CapObj::Sc(sc) => {
            let sc = unsafe { sc.as_ref() };
            if sc.kobj.mark_dying() {
                sc::pre_free(sc);
            }
        }
        CapObj::Sm(sm) => {
            let sm = unsafe { sm.as_ref() };
            if sm.kobj.mark_dying() {
                sm.drain();
            }
        }
        CapObj::Pd(target) => {
            let target = unsafe { target.as_ref() };
            if target.kobj.mark_dying() {
                pd::pre_free(target);
            }
        }
        CapObj::Ec(target) => {
            let target = unsafe { target.as_ref() };
            if target.kobj.mark_dying() {
                ec::pre_free(target);
            }
        }
        CapObj::Pt(_) => {}
    }
}

/// Drop the reference the root node held; invoked from the node's RCU
/// callback after the grace period.
pub fn object_release(obj: CapObj) {
    match obj {
        CapObj::Pd(target) => {
            if unsafe { target.as_ref() }.kobj.del_ref() {
                unsafe { pd::destroy(target) };
            }
        }
        CapObj::Ec(target) => {
            if unsafe { target.as_ref() }.kobj.del_ref() {
                unsafe { ec::destroy(target) };
            }
        }
        CapObj::Sc(target) => {
            if unsafe { target.as_ref() }.kobj.del_ref() {
                unsafe { sc::destroy(target) };
            }
        }
        CapObj::Pt(target) => {
            if unsafe { target.as_ref() }.kobj.del_ref() {
                unsafe { pt::destroy(target) };
            }
        }
        CapObj::Sm(target) => {
            if unsafe { target.as_ref() }.kobj.del_ref() {
                unsafe { sm::destroy(target) };
            }
        }
    }
}

impl Space for SpaceObj {
    const KIND: SpaceKind = SpaceKind::Obj;

    fn of(pd: &Pd) -> &Self {
        &pd.obj
    }

    fn tree(&self) -> &RwLock<MdbTree> {
        &self.tree
    }

    fn sticky_sub(_sub: usize) -> usize {
        0
    }

    fn update(&self, _pd: &Pd, mdb: &Mdb, strip: usize) -> bool {
        let _guard = mdb.node_lock.lock();

        let attr = mdb.attr() & !strip;
        let mut changed = false;

        if attr == 0 {
            {
                let mut caps = self.caps.write();
                for sel in mdb.node_base..mdb.node_base + (1 << mdb.node_order) {
                    changed |= caps.remove(&sel).is_some();
                }
            }

            // Invoked without the table lock: tearing a domain down
            // revokes its own object space recursively.
            if strip != 0 {
                if let Some(obj) = mdb.object {
                    pre_free(obj);
                }
            }

            return changed;
        }

        let Some(obj) = resolve_obj(mdb) else {
            return false;
        };

        let mut caps = self.caps.write();
        for sel in mdb.node_base..mdb.node_base + (1 << mdb.node_order) {
            let cap = Capability { obj, attr };
            let old = caps.insert(sel, cap);
            changed |= old.map(|o| o.attr != attr).unwrap_or(true);
        }

        changed
    }
}
