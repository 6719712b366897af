/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: pd                                                              ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Protection domains and the delegation/revocation engine.                ║
   ║                                                                         ║
   ║ A domain aggregates its three resource spaces, a page quota, the slab   ║
   ║ caches for the objects it creates and up to seven IOMMU requester      ║
   ║ ids. delegate() copies a clamped capability range from another          ║
   ║ domain, recording each copy in the mapping database and replicating     ║
   ║ it into the shadow structures; revoke() sweeps a derivation subtree,    ║
   ║ demoting and unlinking every node that projects into the revoked        ║
   ║ range.                                                                  ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, Univ. Duesseldorf                               ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::cap::mdb;
use crate::cap::mdb::Mdb;
use crate::consts::{MAX_CPUS, NUM_RIDS, POOL_SIZE};
use crate::device::cpu;
use crate::device::cpu::{HZD_IOMMU, HZD_OOM};
use crate::device::iommu;
use crate::memory::pool;
use crate::process::ec::{Ec, Fpu};
use crate::process::pt::Pt;
use crate::process::sc::Sc;
use crate::process::sm::Sm;
use crate::process::Kobject;
use crate::rcu;
use crate::space::space_mem;
use crate::space::space_mem::SpaceMem;
use crate::space::space_obj::SpaceObj;
use crate::space::space_pio::SpacePio;
use crate::space::Space;
use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::AtomicPtr;
use core::sync::atomic::Ordering::SeqCst;
use log::{error, warn};
use mm::{PAGE_BITS, Quota, SlabCache};
use spin::{Mutex, Once};
use syscall::crd::{clamp, clamp_hotspot, ATTR_FULL};
use syscall::{Crd, CrdKind};
use x86_64::instructions::tlb;

static PD_CACHE: SlabCache = SlabCache::new(size_of::<Pd>());

/// The boot budget; everything is transferred to the kernel domain during
/// init and from there to the root domain.
static INIT_QUOTA: Quota = Quota::new(POOL_SIZE >> PAGE_BITS);

struct PdPtr(NonNull<Pd>);

unsafe impl Send for PdPtr {}
unsafe impl Sync for PdPtr {}

static KERN_PD: Once<PdPtr> = Once::new();
static ROOT_PD: Once<PdPtr> = Once::new();
static CURRENT: [AtomicPtr<Pd>; MAX_CPUS] = [const { AtomicPtr::new(core::ptr::null_mut()) }; MAX_CPUS];

struct RidTable {
    rids: [u16; NUM_RIDS],
    used: u8,
}

pub struct Pd {
    pub kobj: Kobject,

    pub mem: SpaceMem,
    pub pio: SpacePio,
    pub obj: SpaceObj,

    pub quota: Quota,

    pub pt_cache: SlabCache,
    pub mdb_cache: SlabCache,
    pub sm_cache: SlabCache,
    pub sc_cache: SlabCache,
    pub ec_cache: SlabCache,
    pub fpu_cache: SlabCache,

    rids: Mutex<RidTable>,
}

unsafe impl Send for Pd {}
unsafe impl Sync for Pd {}

unsafe fn free_pd(obj: *mut ()) {
    unsafe { destroy(NonNull::new_unchecked(obj as *mut Pd)) };
}

fn construct(raw: NonNull<Pd>) -> Pd {
    Pd {
        kobj: Kobject::new(raw.as_ptr() as *mut (), free_pd),
        mem: SpaceMem::new(),
        pio: SpacePio::new(),
        obj: SpaceObj::new(),
        quota: Quota::empty(),
        pt_cache: SlabCache::new(size_of::<Pt>()),
        mdb_cache: SlabCache::new(size_of::<Mdb>()),
        sm_cache: SlabCache::new(size_of::<Sm>()),
        sc_cache: SlabCache::new(size_of::<Sc>()),
        ec_cache: SlabCache::new(size_of::<Ec>()),
        fpu_cache: SlabCache::new(size_of::<Fpu>()),
        rids: Mutex::new(RidTable { rids: [0; NUM_RIDS], used: 0 }),
    }
}

impl Pd {
    /// Allocate a new domain from the creator's quota and move `limit`
    /// pages of budget into it.
    pub fn create(creator: &Pd, limit: usize) -> Option<NonNull<Pd>> {
        let raw = PD_CACHE.alloc(pool::buddy(), &creator.quota)?.cast::<Pd>();
        unsafe { raw.as_ptr().write(construct(raw)) };

        let pd = unsafe { raw.as_ref() };
        if !creator.quota.transfer_to(&pd.quota, limit) {
            unsafe {
                core::ptr::drop_in_place(raw.as_ptr());
                PD_CACHE.free(raw.cast());
            }
            return None;
        }

        Some(raw)
    }

    /// Recursive range-clamped copy of mappings from `snd` into this
    /// domain. Returns true iff any shadow structure changed, which is the
    /// caller's signal to run a shootdown.
    pub fn delegate<S: Space>(&self, snd: &Pd, snd_base: usize, rcv_base: usize, ord: usize, attr: usize, sub: usize) -> bool {
        let mut s = false;
        let mut addr = snd_base;

        loop {
            let lookup = S::of(snd).tree().read().lookup(addr, true);
            let Some(mdb_ptr) = lookup else {
                break;
            };
            let src = unsafe { mdb_ptr.as_ref() };

            let mut b = snd_base;
            let Some(o) = clamp(src.node_base, &mut b, src.node_order, ord) else {
                break;
            };

            addr = src.node_base + (1 << src.node_order);

            if self.quota.hit_limit(1) {
                cpu::set_hazard(HZD_OOM);
                return s;
            }

            let node = Mdb::create(
                self,
                S::KIND,
                b - src.node_base + src.node_phys,
                b - snd_base + rcv_base,
                o,
                0,
                src.node_type,
                S::sticky_sub(src.node_sub) | sub,
                src.dpth + 1,
                None,
            );
            let Some(node) = node else {
                cpu::set_hazard(HZD_OOM);
                return s;
            };

            if !S::of(self).tree().write().insert(node) {
                unsafe { Mdb::destroy(node) };

                // Re-delegation of the same mapping is a silent no-op;
                // anything else is an overmap attempt.
                let existing = S::of(self).tree().read().lookup(b - snd_base + rcv_base, false);
                let same_parent = existing
                    .map(|x| unsafe { x.as_ref() }.prnt() == Some(mdb_ptr))
                    .unwrap_or(false);

                if !same_parent {
                    warn!(
                        "overmap attempt {:?} - tree - PD:{:p}->{:p} SB:{:#010x} RB:{:#010x} O:{:#04x} A:{:#x} SUB:{:x}",
                        S::KIND, snd, self, snd_base, rcv_base, ord, attr, sub
                    );
                }

                continue;
            }

            if !unsafe { node.as_ref() }.insert_node(mdb_ptr, attr) {
                if S::of(self).tree().write().remove(node) {
                    mdb::call_rcu(node);
                }

                warn!(
                    "overmap attempt {:?} - node - PD:{:p}->{:p} SB:{:#010x} RB:{:#010x} O:{:#04x} A:{:#x} SUB:{:x}",
                    S::KIND, snd, self, snd_base, rcv_base, ord, attr, sub
                );
                continue;
            }

            s |= S::of(self).update(self, unsafe { node.as_ref() }, 0);

            if cpu::chk_hazard(HZD_OOM) {
                // Undo the partially installed node; earlier mappings of
                // this transfer stay.
                let node_ref = unsafe { node.as_ref() };
                s |= S::of(self).update(self, node_ref, attr);
                node_ref.demote_node(attr);
                if node_ref.remove_node(true) && S::of(self).tree().write().remove(node) {
                    mdb::call_rcu(node);
                }
                return s;
            }
        }

        s
    }

    /// Remove or demote every mapping that projects through this domain's
    /// nodes into `[base, base + 2^ord)`. With `self_` the domain's own
    /// node is demoted too, not only the derived ones; with `kim` a node
    /// that still has children stays in the mapping database with zero
    /// attributes so later partial revocations can find the range.
    pub fn revoke<S: Space>(&self, base: usize, ord: usize, attr: usize, self_: bool, kim: bool) {
        let mut addr = base;

        loop {
            let lookup = S::of(self).tree().read().lookup(addr, true);
            let Some(mdb_ptr) = lookup else {
                break;
            };
            let mdb = unsafe { mdb_ptr.as_ref() };

            let mut b = base;
            let Some(o) = clamp(mdb.node_base, &mut b, mdb.node_order, ord) else {
                break;
            };

            addr = mdb.node_base + (1 << mdb.node_order);

            if kim && unsafe { mdb.next_ptr().as_ref() }.dpth > mdb.dpth {
                if mdb.attr() & ATTR_FULL != 0 {
                    if mdb.node_sub & 0x1 != 0 {
                        cpu::set_hazard(HZD_IOMMU);
                    }

                    S::of(mdb.pd()).update(mdb.pd(), mdb, ATTR_FULL);
                    mdb.demote_node(ATTR_FULL);
                }

                let preempt = cpu::preemption();
                if preempt {
                    cpu::preempt_disable();
                }

                if mdb.remove_node(false) && S::of(mdb.pd()).tree().write().remove(mdb_ptr) {
                    mdb::call_rcu(mdb_ptr);
                }

                if preempt {
                    cpu::preempt_enable();
                }

                continue;
            }

            let d = mdb.dpth;
            let mut node_ptr = mdb_ptr;
            let mut demote = false;

            if self_ {
                let mut p = b - mdb.node_base + mdb.node_phys;
                demote = clamp(mdb.node_phys, &mut p, mdb.node_order, o).is_some();
            }

            // Forward sweep: demote every node in the subtree whose frames
            // project back through `mdb` into the revoked range.
            loop {
                let node = unsafe { node_ptr.as_ref() };

                if demote && node.attr() & attr != 0 {
                    if mdb.node_sub & 0x1 != 0 {
                        cpu::set_hazard(HZD_IOMMU);
                    }

                    S::of(node.pd()).update(node.pd(), node, attr);
                    node.demote_node(attr);
                }

                let next = node.next_ptr();
                let next_ref = unsafe { next.as_ref() };

                if next_ref.dpth <= d {
                    break;
                }

                if !self_ && next_ref.prnt() == Some(mdb_ptr) {
                    let mut p = b - mdb.node_base + mdb.node_phys;
                    demote = clamp(next_ref.node_phys, &mut p, next_ref.node_order, o).is_some();
                }

                node_ptr = next;
            }

            // Backward sweep: unlink bottom-up. Only nodes demoted to zero
            // attributes actually leave the ring; preemption is disabled
            // across each individual splice.
            let preempt = cpu::preemption();

            loop {
                let node = unsafe { node_ptr.as_ref() };

                if preempt {
                    cpu::preempt_disable();
                }

                if node.remove_node(true) && S::of(node.pd()).tree().write().remove(node_ptr) {
                    mdb::call_rcu(node_ptr);
                }

                if preempt {
                    cpu::preempt_enable();
                }

                let prev = node.prev_ptr();

                if node.dpth <= d {
                    break;
                }

                node_ptr = prev;
            }
        }

        if !cpu::preemption() && cpu::chk_hazard(HZD_IOMMU) {
            self.flush_pgt();
            cpu::clr_hazard(HZD_IOMMU);
        }
    }

    /// Typed delegation entry: clamp the sender's capability against the
    /// receive window and dispatch on the kind. `crd` is rewritten to what
    /// was actually transferred.
    pub fn del_crd(&self, snd: &Pd, del: Crd, crd: &mut Crd, sub: usize, hot: usize) {
        let st = crd.kind();
        let rt = del.kind();
        let a = crd.attr() & del.attr();

        let mut sb = crd.base();
        let so = crd.order();
        let mut rb = del.base();
        let ro = del.order();

        if st != rt || a == 0 || rt == CrdKind::Null {
            *crd = Crd::null();
            return;
        }

        let mut s = false;
        let o;

        match rt {
            CrdKind::Mem => {
                o = clamp_hotspot(&mut sb, &mut rb, so, ro, hot);
                s = self.delegate::<SpaceMem>(snd, sb, rb, o, a, sub);
            }

            CrdKind::Pio => {
                match clamp(sb, &mut rb, so, ro) {
                    Some(order) => o = order,
                    None => {
                        *crd = Crd::null();
                        return;
                    }
                }
                self.delegate::<SpacePio>(snd, rb, rb, o, a, sub);
            }

            CrdKind::Obj => {
                o = clamp_hotspot(&mut sb, &mut rb, so, ro, hot);
                s = self.delegate::<SpaceObj>(snd, sb, rb, o, a, 0);
            }

            CrdKind::Null => unreachable!(),
        }

        *crd = Crd::new(rt, rb, o, a);

        if s && rt == CrdKind::Obj {
            self.mem.htlb.merge(&self.mem.cpus);
        }

        if s && sub & 0x1 != 0 {
            self.flush_pgt();
        }

        if s {
            space_mem::shootdown(self);
        }
    }

    /// Typed revocation entry.
    pub fn rev_crd(&self, crd: Crd, self_: bool, preempt: bool, kim: bool) {
        if preempt {
            cpu::preempt_enable();
        }

        match crd.kind() {
            CrdKind::Mem => self.revoke::<SpaceMem>(crd.base(), crd.order(), crd.attr(), self_, kim),
            CrdKind::Pio => self.revoke::<SpacePio>(crd.base(), crd.order(), crd.attr(), self_, kim),
            CrdKind::Obj => self.revoke::<SpaceObj>(crd.base(), crd.order(), crd.attr(), self_, kim),
            CrdKind::Null => {}
        }

        if preempt {
            cpu::preempt_disable();
        }

        if cpu::chk_hazard(HZD_IOMMU) {
            self.flush_pgt();
            cpu::clr_hazard(HZD_IOMMU);
        }

        if crd.kind() == CrdKind::Mem {
            space_mem::shootdown(self);
        }
    }

    /// Translate a sender capability into this domain: find the closest
    /// ancestor mapping that lives here and clamp it into the translate
    /// window.
    pub fn xlt_crd(&self, snd: &Pd, xlt: Crd, crd: &mut Crd) {
        let translated = match xlt.kind() {
            t if t != crd.kind() || t == CrdKind::Null => false,
            CrdKind::Mem => self.xlt_inner::<SpaceMem>(snd, xlt, crd),
            CrdKind::Pio => self.xlt_inner::<SpacePio>(snd, xlt, crd),
            CrdKind::Obj => self.xlt_inner::<SpaceObj>(snd, xlt, crd),
            CrdKind::Null => false,
        };

        if !translated {
            *crd = Crd::null();
        }
    }

    fn xlt_inner<S: Space>(&self, snd: &Pd, xlt: Crd, crd: &mut Crd) -> bool {
        let sb = crd.base();
        let so = crd.order();
        let mut rb = xlt.base();
        let mut ro = xlt.order();

        let lookup = S::of(snd).tree().read().lookup(sb, false);
        let Some(mdb_ptr) = lookup else {
            return false;
        };
        let mdb = unsafe { mdb_ptr.as_ref() };

        let mut found = None;
        let mut cursor = Some(mdb_ptr);

        while let Some(node_ptr) = cursor {
            let node = unsafe { node_ptr.as_ref() };

            if core::ptr::eq(node.pd(), self) && node_ptr != mdb_ptr {
                let mut window = rb;
                if let Some(order) = clamp(node.node_base, &mut window, node.node_order, ro) {
                    rb = window;
                    ro = order;
                    found = Some(node_ptr);
                    break;
                }
            }

            cursor = node.prnt();
        }

        if found.is_none() && core::ptr::eq(mdb.pd(), self) {
            // Sender and receiver share the space: return the item itself.
            let mut window = xlt.base();
            if let Some(order) = clamp(mdb.node_base, &mut window, mdb.node_order, xlt.order()) {
                rb = window;
                ro = order;
                found = Some(mdb_ptr);
            }
        }

        let Some(node_ptr) = found else {
            return false;
        };
        let node = unsafe { node_ptr.as_ref() };

        let mut sb2 = sb;
        let Some(so2) = clamp(mdb.node_base, &mut sb2, mdb.node_order, so) else {
            return false;
        };

        let sb3 = (sb2 - mdb.node_base) + (mdb.node_phys - node.node_phys) + node.node_base;

        let mut window = rb;
        if let Some(order) = clamp(sb3, &mut window, so2, ro) {
            *crd = Crd::new(crd.kind(), window, order, mdb.attr());
            return true;
        }

        false
    }

    /// Report the live mapping covering a capability, if any.
    pub fn lookup_crd(&self, crd: &mut Crd) {
        let result = match crd.kind() {
            CrdKind::Mem => self.lookup_inner::<SpaceMem>(*crd),
            CrdKind::Pio => self.lookup_inner::<SpacePio>(*crd),
            CrdKind::Obj => self.lookup_inner::<SpaceObj>(*crd),
            CrdKind::Null => None,
        };

        *crd = result.unwrap_or(Crd::null());
    }

    fn lookup_inner<S: Space>(&self, crd: Crd) -> Option<Crd> {
        let node_ptr = S::of(self).tree().read().lookup(crd.base(), false)?;
        let node = unsafe { node_ptr.as_ref() };

        if node.attr() == 0 {
            return None;
        }

        Some(Crd::new(crd.kind(), node.node_base, node.node_order, node.attr()))
    }

    /// Record an IOMMU requester id. Idempotent for already assigned ids;
    /// the domain is pinned while a device references its tables.
    pub fn assign_rid(&self, rid: u16) {
        let _guard = self.kobj.lock.lock();
        let mut table = self.rids.lock();

        let mut free = NUM_RIDS;
        for i in 0..NUM_RIDS {
            if table.used & (1 << i) == 0 {
                if i < free {
                    free = i;
                }
            } else if table.rids[i] == rid {
                // already assigned - avoid an extra reference
                return;
            }
        }

        // The IOMMU holds a physical pointer into our page tables.
        let ok = self.kobj.add_ref();
        assert!(ok);

        if free >= NUM_RIDS {
            error!("too many devices assigned - pd will not be freed");
            return;
        }

        table.rids[free] = rid;
        table.used |= 1 << free;
    }

    pub fn release_rid<F: Fn(u16)>(&self, release: F) {
        for i in 0..NUM_RIDS {
            let rid = {
                let _guard = self.kobj.lock.lock();
                let mut table = self.rids.lock();

                if table.used & (1 << i) == 0 {
                    continue;
                }

                table.used ^= 1 << i;
                let _ = self.kobj.del_ref();
                table.rids[i]
            };

            release(rid);
        }
    }

    /// Flush the IOMMU page tables of every requester id bound to this
    /// domain.
    pub fn flush_pgt(&self) {
        let table = self.rids.lock();

        for i in 0..NUM_RIDS {
            if table.used & (1 << i) != 0 {
                iommu::Interface::flush_pgt(table.rids[i], self);
            }
        }
    }

    /// Switch the executing CPU to this domain's address space.
    pub fn make_current(this: NonNull<Pd>) {
        let cpu = cpu::id();
        let pd = unsafe { this.as_ref() };

        if pd.mem.htlb.chk(cpu) {
            pd.mem.htlb.clr(cpu);
            tlb::flush_all();
        } else if CURRENT[cpu].load(SeqCst) == this.as_ptr() {
            return;
        }

        let ok = pd.kobj.add_ref();
        assert!(ok);

        let old = CURRENT[cpu].swap(this.as_ptr(), SeqCst);
        if let Some(old) = NonNull::new(old) {
            let old = unsafe { old.as_ref() };
            if old.kobj.del_rcu() {
                rcu::call(&old.kobj.rcu);
            }
        }
    }
}

/// Revoke everything the domain holds and release its requester ids.
/// Runs when the domain's root capability is revoked.
pub fn pre_free(pd: &Pd) {
    // Order 63 covers any node base regardless of the Crd field width.
    pd.revoke::<SpaceMem>(0, 63, ATTR_FULL, true, false);
    pd.revoke::<SpacePio>(0, 63, ATTR_FULL, true, false);
    pd.revoke::<SpaceObj>(0, 63, ATTR_FULL, true, false);

    pd.release_rid(|rid| iommu::Interface::release(rid, pd));
}

/// Final teardown after the grace period: give the shadow tables, the
/// caches and the remaining budget back.
pub unsafe fn destroy(pd: NonNull<Pd>) {
    let p = unsafe { pd.as_ref() };
    assert!(!core::ptr::eq(p, current()), "destroying the current domain");

    pre_free(p);

    let buddy = pool::buddy();
    p.mem.clear_all(&p.quota);
    p.pio.clear(p);

    unsafe {
        p.pt_cache.destroy(buddy, &p.quota);
        p.sm_cache.destroy(buddy, &p.quota);
        p.sc_cache.destroy(buddy, &p.quota);
        p.ec_cache.destroy(buddy, &p.quota);
        p.fpu_cache.destroy(buddy, &p.quota);
        p.mdb_cache.destroy(buddy, &p.quota);
    }

    p.quota.free_up(&root().quota);

    unsafe {
        core::ptr::drop_in_place(pd.as_ptr());
        PD_CACHE.free(pd.cast());
    }
}

/// Construct the kernel and root domains. The kernel domain owns the
/// physical pool and all I/O ports; the root domain receives the
/// remaining boot budget and its initial mappings by delegation.
pub fn init(cpu: usize) {
    KERN_PD.call_once(|| {
        let raw = PD_CACHE
            .alloc(pool::buddy(), &INIT_QUOTA)
            .expect("failed to allocate the kernel domain")
            .cast::<Pd>();
        unsafe { raw.as_ptr().write(construct(raw)) };

        let kern = unsafe { raw.as_ref() };
        let moved = INIT_QUOTA.transfer_to(&kern.quota, INIT_QUOTA.limit() - INIT_QUOTA.used());
        assert!(moved);

        kern.mem.insert_root(kern, pool::base_page(), pool::pages(), ATTR_FULL, 0);
        kern.pio.addreg(kern, 0, 1 << 16, ATTR_FULL);

        PdPtr(raw)
    });

    ROOT_PD.call_once(|| {
        let kern = kern();
        let raw = Pd::create(kern, kern.quota.limit() - kern.quota.used() - 64).expect("failed to allocate the root domain");

        let root = unsafe { raw.as_ref() };
        root.mem.init(root, cpu);

        // The root domain holds a capability to itself at selector 0.
        let installed = root.obj.insert_root(root, 0, ATTR_FULL, crate::space::space_obj::CapObj::Pd(raw));
        assert!(installed);

        PdPtr(raw)
    });

    let root = &ROOT_PD.get().unwrap().0;
    Pd::make_current(*root);
}

pub fn kern() -> &'static Pd {
    unsafe { KERN_PD.get().expect("kernel domain not initialized").0.as_ref() }
}

pub fn root() -> &'static Pd {
    unsafe { ROOT_PD.get().expect("root domain not initialized").0.as_ref() }
}

/// The domain the executing CPU runs user code of.
pub fn current() -> &'static Pd {
    let ptr = CURRENT[cpu::id()].load(SeqCst);
    match NonNull::new(ptr) {
        Some(pd) => unsafe { pd.as_ref() },
        None => root(),
    }
}

/// The domain currently active on a (possibly remote) CPU.
pub fn remote(cpu: usize) -> Option<&'static Pd> {
    NonNull::new(CURRENT[cpu].load(SeqCst)).map(|pd| unsafe { pd.as_ref() })
}

impl Pd {
    /// See [`remote`]; method form used by the shootdown loop.
    pub fn remote(cpu: usize) -> Option<&'static Pd> {
        remote(cpu)
    }
}
