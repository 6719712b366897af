/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: space_mem                                                       ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Memory space of a protection domain. Owns the mapping tree for page     ║
   ║ capabilities and replicates every mapping mutation into the host page   ║
   ║ table, the per-CPU copies, the guest (NPT/EPT) table and the IOMMU      ║
   ║ (DMAR/IR) tables. Changed replicas raise the bits the cross-CPU         ║
   ║ shootdown consumes.                                                     ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, Univ. Duesseldorf                               ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::cap::mdb;
use crate::cap::mdb::{Mdb, MdbTree};
use crate::consts::{MAX_CPUS, USER_PAGES_END};
use crate::device::cpu;
use crate::device::cpu::{CpuSet, HZD_OOM, HZD_SCHED};
use crate::device::iommu;
use crate::device::lapic;
use crate::interrupt::interrupt_dispatcher::VEC_IPI_RKE;
use crate::memory::pages::{hw_attr, Pgt, UpdateOp};
use crate::memory::pool;
use crate::process::pd::Pd;
use crate::space::{Space, SpaceKind};
use core::cmp::min;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering::SeqCst;
use log::warn;
use spin::RwLock;
use x86_64::instructions::interrupts;

/// AMD nested paging instead of Intel EPT for the guest table.
static HAS_NPT: AtomicBool = AtomicBool::new(false);

pub fn set_has_npt(npt: bool) {
    HAS_NPT.store(npt, SeqCst);
}

pub struct SpaceMem {
    tree: RwLock<MdbTree>,

    /// Host page table and its per-CPU replicas.
    pub hpt: Pgt,
    loc: [Pgt; MAX_CPUS],

    /// Guest page table (one of them, depending on the vendor).
    npt: Pgt,
    ept: Pgt,

    /// IOMMU page tables for DMA and interrupt remapping.
    dpt: Pgt,
    ipt: Pgt,

    /// CPUs this domain has run on, and per-CPU pending host/guest TLB
    /// invalidations.
    pub cpus: CpuSet,
    pub htlb: CpuSet,
    pub gtlb: CpuSet,
}

impl SpaceMem {
    pub const fn new() -> Self {
        Self {
            tree: RwLock::new(MdbTree::new()),
            hpt: Pgt::new(4, 9),
            loc: [const { Pgt::new(4, 9) }; MAX_CPUS],
            npt: Pgt::new(4, 9),
            ept: Pgt::new(4, 9),
            dpt: Pgt::new(4, 9),
            ipt: Pgt::new(4, 9),
            cpus: CpuSet::new(),
            htlb: CpuSet::new(),
            gtlb: CpuSet::new(),
        }
    }

    /// First execution on `cpu`: activate the per-CPU replica of the host
    /// table.
    pub fn init(&self, pd: &Pd, cpu: usize) {
        if self.cpus.set(cpu) {
            self.loc[cpu].activate(&pd.quota, pool::buddy());
        }
    }

    /// Translate a page through the host table; test and fault-path hook.
    pub fn hpt_lookup(&self, page: usize) -> Option<(usize, x86_64::structures::paging::PageTableFlags)> {
        self.hpt.lookup(page)
    }

    /// Seed the space with root mappings for a physical region, split into
    /// naturally aligned power-of-two nodes.
    pub fn insert_root(&self, pd: &Pd, mut base: usize, mut pages: usize, attr: usize, typ: u32) {
        while pages > 0 {
            let align = if base == 0 { usize::BITS as usize - 1 } else { base.trailing_zeros() as usize };
            let fit = usize::BITS as usize - 1 - pages.leading_zeros() as usize;
            let order = min(align, fit);

            let node = Mdb::create(pd, SpaceKind::Mem, base, base, order, attr, typ, 0, 0, None)
                .expect("failed to allocate root mapping");

            if !self.tree.write().insert(node) {
                panic!("root mapping overlaps an existing node");
            }

            base += 1 << order;
            pages -= 1 << order;
        }
    }

    /// Record an execution context's UTCB page so that revocation finds it.
    pub fn insert_utcb(&self, pd: &Pd, page: usize, phys: usize) -> bool {
        if page == 0 || phys == 0 {
            return true;
        }

        let Some(node) = Mdb::create(pd, SpaceKind::Mem, phys, page, 0, 0x3, 0, 0, 0, None) else {
            return false;
        };

        if self.tree.write().insert(node) {
            return true;
        }

        unsafe { Mdb::destroy(node) };
        false
    }

    /// Free every shadow table of this space back to the buddy.
    pub fn clear_all(&self, quota: &mm::Quota) {
        let buddy = pool::buddy();

        self.hpt.clear(quota, buddy);
        for cpu in 0..MAX_CPUS {
            self.loc[cpu].clear(quota, buddy);
        }
        self.npt.clear(quota, buddy);
        self.ept.clear(quota, buddy);
        self.dpt.clear(quota, buddy);
        self.ipt.clear(quota, buddy);
    }

    pub fn remove_utcb(&self, page: usize) -> bool {
        let Some(node) = self.tree.read().lookup(page, false) else {
            return false;
        };

        let mdb = unsafe { node.as_ref() };
        mdb.demote_node(0x3);

        if mdb.remove_node(true) && self.tree.write().remove(node) {
            mdb::call_rcu(node);
            return true;
        }

        false
    }
}

impl Space for SpaceMem {
    const KIND: SpaceKind = SpaceKind::Mem;

    fn of(pd: &Pd) -> &Self {
        &pd.mem
    }

    fn tree(&self) -> &RwLock<MdbTree> {
        &self.tree
    }

    fn sticky_sub(sub: usize) -> usize {
        // IOMMU and guest visibility follow the parent mapping.
        sub & 0x3
    }

    fn update(&self, pd: &Pd, mdb: &Mdb, strip: usize) -> bool {
        let _guard = mdb.node_lock.lock();

        let p = mdb.node_phys;
        let b = mdb.node_base;
        let o = mdb.node_order;
        let a = mdb.attr() & !strip;
        let s = mdb.node_sub;
        let r = strip;

        let quota = &pd.quota;
        let buddy = pool::buddy();
        let mut f = false;

        if s & 0x1 != 0 && iommu::dmar_active() {
            let ord = min(o, self.dpt.max_ord());
            for i in 0..1usize << (o - ord) {
                if r == 0 && !self.dpt.check(quota, ord) {
                    cpu::set_hazard(HZD_OOM);
                    return false;
                }

                f |= self.dpt.update(quota, buddy, b + (i << ord), ord, p + (i << ord), hw_attr(a, false), op(r));
            }
        }

        if s & 0x1 != 0 && iommu::ir_active() {
            let ord = min(o, self.ipt.max_ord());
            for i in 0..1usize << (o - ord) {
                if r == 0 && !self.ipt.check(quota, ord) {
                    cpu::set_hazard(HZD_OOM);
                    return false;
                }

                f |= self.ipt.update(quota, buddy, b + (i << ord), ord, p + (i << ord), hw_attr(a, false), op(r));
            }
        }

        if s & 0x2 != 0 {
            let gpt = if HAS_NPT.load(SeqCst) { &self.npt } else { &self.ept };
            let ord = min(o, gpt.max_ord());
            for i in 0..1usize << (o - ord) {
                if r == 0 && !gpt.check(quota, ord) {
                    cpu::set_hazard(HZD_OOM);
                    return false;
                }

                f |= gpt.update(quota, buddy, b + (i << ord), ord, p + (i << ord), hw_attr(a, false), op(r));
            }

            if r != 0 {
                self.gtlb.merge(&self.cpus);
            }
        }

        // The host table only carries user mappings.
        if b >= USER_PAGES_END || b + (1 << o) > USER_PAGES_END || b + (1 << o) <= b {
            return f;
        }

        let wt = s & 0x4 != 0;
        let ord = min(o, self.hpt.max_ord());

        for i in 0..1usize << (o - ord) {
            if r == 0 && !self.hpt.check(quota, ord) {
                cpu::set_hazard(HZD_OOM);
                return f;
            }

            f |= self.hpt.update(quota, buddy, b + (i << ord), ord, p + (i << ord), hw_attr(a, wt), op(r));
        }

        if r != 0 || f {
            for j in 0..MAX_CPUS {
                if !self.loc[j].active() {
                    continue;
                }

                for i in 0..1usize << (o - ord) {
                    if r == 0 && !self.loc[j].check(quota, ord) {
                        cpu::set_hazard(HZD_OOM);
                        return r != 0 || f;
                    }

                    self.loc[j].update(quota, buddy, b + (i << ord), ord, p + (i << ord), hw_attr(a, wt), UpdateOp::Mirror);
                }
            }

            self.htlb.merge(&self.cpus);
        }

        r != 0 || f
    }
}

fn op(strip: usize) -> UpdateOp {
    if strip == 0 { UpdateOp::Install } else { UpdateOp::Strip }
}

/// Cross-CPU TLB shootdown. Every online CPU the domain has run on and
/// that still has a pending host or guest invalidation gets a kick IPI;
/// the sender spins (with interrupts open) until the remote interrupt
/// counter advances. The local CPU signs off via its own hazard instead.
pub fn shootdown(local: &Pd) {
    for target in 0..MAX_CPUS {
        if !cpu::online(target) {
            continue;
        }

        if !local.mem.cpus.chk(target) {
            continue;
        }

        let Some(pd) = Pd::remote(target) else {
            continue;
        };

        if !pd.mem.htlb.chk(target) && !pd.mem.gtlb.chk(target) {
            continue;
        }

        if cpu::id() == target {
            cpu::set_hazard(HZD_SCHED);
            continue;
        }

        let counter = cpu::irq_count(target);

        lapic::send_ipi(target, VEC_IPI_RKE);

        let preempt = cpu::preemption();
        if !preempt {
            interrupts::enable();
        }

        let acked = lapic::pause_loop_until(500, || cpu::irq_count(target) == counter);

        if !preempt {
            interrupts::disable();
        }

        if !acked {
            warn!("IPI timeout cpu {} -> {}", cpu::id(), target);
        }
    }
}
