/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: space_pio                                                       ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ I/O port space of a protection domain. The shadow structure is the      ║
   ║ 64 KiB I/O permission bitmap (one denied-bit per port) the hardware     ║
   ║ consults on user port accesses.                                         ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, HHU                                             ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::cap::mdb::{Mdb, MdbTree};
use crate::device::cpu;
use crate::device::cpu::HZD_OOM;
use crate::memory::pool;
use crate::process::pd::Pd;
use crate::space::{Space, SpaceKind};
use core::ptr::NonNull;
use spin::{Mutex, RwLock};
use syscall::crd::PIO_ACCESS;

/// 65536 ports, one bit each.
const BITMAP_ORDER: usize = 1;
const NUM_PORTS: usize = 1 << 16;

pub struct SpacePio {
    tree: RwLock<MdbTree>,
    bitmap: Mutex<Option<NonNull<u8>>>,
}

unsafe impl Send for SpacePio {}
unsafe impl Sync for SpacePio {}

impl SpacePio {
    pub const fn new() -> Self {
        Self {
            tree: RwLock::new(MdbTree::new()),
            bitmap: Mutex::new(None),
        }
    }

    /// Seed the space with a root node covering a port range; used for the
    /// kernel domain, which owns all ports.
    pub fn addreg(&self, pd: &Pd, mut base: usize, mut count: usize, attr: usize) {
        while count > 0 {
            let align = if base == 0 { usize::BITS as usize - 1 } else { base.trailing_zeros() as usize };
            let fit = usize::BITS as usize - 1 - count.leading_zeros() as usize;
            let order = core::cmp::min(align, fit);

            let node = Mdb::create(pd, SpaceKind::Pio, base, base, order, attr, 0, 0, 0, None)
                .expect("failed to allocate root port mapping");

            if !self.tree.write().insert(node) {
                panic!("root port mapping overlaps an existing node");
            }

            base += 1 << order;
            count -= 1 << order;
        }
    }

    /// May the domain access `port`?
    pub fn lookup(&self, port: usize) -> bool {
        let bitmap = self.bitmap.lock();
        let Some(bits) = *bitmap else {
            return false;
        };

        let byte = unsafe { *bits.as_ptr().add(port / 8) };
        byte & (1 << (port % 8)) == 0
    }
}

impl Space for SpacePio {
    const KIND: SpaceKind = SpaceKind::Pio;

    fn of(pd: &Pd) -> &Self {
        &pd.pio
    }

    fn tree(&self) -> &RwLock<MdbTree> {
        &self.tree
    }

    fn sticky_sub(_sub: usize) -> usize {
        0
    }

    fn update(&self, pd: &Pd, mdb: &Mdb, strip: usize) -> bool {
        let _guard = mdb.node_lock.lock();

        let allowed = mdb.attr() & !strip & PIO_ACCESS != 0;

        let mut bitmap = self.bitmap.lock();
        if bitmap.is_none() {
            if !allowed {
                return false;
            }

            if pd.quota.hit_limit(1 << BITMAP_ORDER) {
                cpu::set_hazard(HZD_OOM);
                return false;
            }

            let Some(page) = pool::buddy().alloc(&pd.quota, BITMAP_ORDER) else {
                cpu::set_hazard(HZD_OOM);
                return false;
            };

            // All ports start out denied.
            unsafe { core::ptr::write_bytes(page.as_ptr(), 0xff, NUM_PORTS / 8) };
            *bitmap = Some(page);
        }

        let bits = bitmap.unwrap().as_ptr();
        let mut changed = false;

        for port in mdb.node_base..mdb.node_base + (1 << mdb.node_order) {
            if port >= NUM_PORTS {
                break;
            }

            let byte = unsafe { bits.add(port / 8) };
            let mask = 1u8 << (port % 8);
            let old = unsafe { *byte };
            let new = if allowed { old & !mask } else { old | mask };

            if old != new {
                unsafe { *byte = new };
                changed = true;
            }
        }

        changed
    }
}

impl SpacePio {
    /// Give the bitmap pages back when the domain dies.
    pub fn clear(&self, pd: &Pd) {
        let mut bitmap = self.bitmap.lock();
        if let Some(page) = bitmap.take() {
            unsafe { pool::buddy().free(&pd.quota, page, BITMAP_ORDER) };
        }
    }
}
