/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: pt                                                              ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Portals. A portal transfers control to its handler EC when      ║
   ║         called; the portal id is delivered to the handler so one EC     ║
   ║         can serve many portals.                                         ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Michael Schoettner, HHU                                         ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::memory::pool;
use crate::process::ec;
use crate::process::ec::Ec;
use crate::process::pd::Pd;
use crate::process::Kobject;
use core::ptr::NonNull;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering::SeqCst;

pub struct Pt {
    pub kobj: Kobject,
    pd: NonNull<Pd>,
    ec: NonNull<Ec>,
    pub ip: usize,
    pub mtd: usize,
    id: AtomicUsize,
}

unsafe impl Send for Pt {}
unsafe impl Sync for Pt {}

unsafe fn free_pt(obj: *mut ()) {
    unsafe { destroy(NonNull::new_unchecked(obj as *mut Pt)) };
}

impl Pt {
    pub fn create(pd: &Pd, ec_ptr: NonNull<Ec>, ip: usize, mtd: usize) -> Option<NonNull<Pt>> {
        let raw = pd.pt_cache.alloc(pool::buddy(), &pd.quota)?.cast::<Pt>();

        let e = unsafe { ec_ptr.as_ref() };
        if !e.kobj.add_ref() {
            unsafe { pd.pt_cache.free(raw.cast()) };
            return None;
        }

        let pt = Pt {
            kobj: Kobject::new(raw.as_ptr() as *mut (), free_pt),
            pd: NonNull::from(pd),
            ec: ec_ptr,
            ip,
            mtd,
            id: AtomicUsize::new(0),
        };

        unsafe { raw.as_ptr().write(pt) };
        Some(raw)
    }

    pub fn ec_ref(&self) -> &Ec {
        unsafe { self.ec.as_ref() }
    }

    pub fn ec_ptr(&self) -> NonNull<Ec> {
        self.ec
    }

    pub fn set_id(&self, id: usize) {
        self.id.store(id, SeqCst);
    }

    pub fn id(&self) -> usize {
        self.id.load(SeqCst)
    }
}

pub unsafe fn destroy(pt: NonNull<Pt>) {
    let p = unsafe { pt.as_ref() };
    let pd = unsafe { p.pd.as_ref() };

    let e = p.ec_ref();
    if e.kobj.del_ref() {
        unsafe { ec::destroy(NonNull::from(e)) };
    }

    unsafe {
        core::ptr::drop_in_place(pt.as_ptr());
        pd.pt_cache.free(pt.cast());
    }
}
