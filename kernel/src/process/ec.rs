/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: ec                                                              ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Execution contexts: the register state and continuation of one user     ║
   ║ thread, bound to a protection domain and a CPU. An EC suspends only     ║
   ║ by blocking on a semaphore, by an explicit scheduler yield or while     ║
   ║ waiting for a portal reply; wakeups run its pending continuation.       ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, HHU                                             ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::consts::MAX_CPUS;
use crate::device::cpu;
use crate::memory::pool;
use crate::process::pd::Pd;
use crate::process::sc::Sc;
use crate::process::Kobject;
use crate::rcu;
use crate::timer;
use core::ptr::NonNull;
use core::sync::atomic::Ordering::SeqCst;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr};
use spin::Mutex;
use syscall::Status;

/// A wakeup path to run instead of returning to user mode.
pub type Continuation = fn() -> !;

/// The architectural state a system call sees and mutates.
pub struct SysRegs {
    pub args: [usize; 5],
    pub status: Status,
    pub si_value: usize,
    pub si_count: usize,
}

/// Lazily saved FPU state, allocated from the owning domain's fpu cache.
pub struct Fpu {
    pub data: [u8; 512],
}

pub struct Ec {
    pub kobj: Kobject,
    pd: NonNull<Pd>,
    pub cpu: usize,
    pub utcb: usize,
    pub evt: usize,

    regs: Mutex<SysRegs>,
    cont: Mutex<Option<Continuation>>,
    sc: AtomicPtr<Sc>,
    partner: AtomicPtr<Ec>,
    blocked: AtomicBool,
    tsc_offset: AtomicI64,
    fpu: Option<NonNull<Fpu>>,
}

unsafe impl Send for Ec {}
unsafe impl Sync for Ec {}

#[derive(Copy, Clone, PartialEq)]
pub struct EcPtr(pub NonNull<Ec>);

unsafe impl Send for EcPtr {}
unsafe impl Sync for EcPtr {}

static CURRENT: [AtomicPtr<Ec>; MAX_CPUS] = [const { AtomicPtr::new(core::ptr::null_mut()) }; MAX_CPUS];

unsafe fn free_ec(obj: *mut ()) {
    unsafe { destroy(NonNull::new_unchecked(obj as *mut Ec)) };
}

impl Ec {
    /// Allocate an execution context (and its FPU state) from the owning
    /// domain's caches and record its UTCB page in the memory space.
    pub fn create(pd: &Pd, cpu: usize, utcb: usize, evt: usize) -> Option<NonNull<Ec>> {
        let raw = pd.ec_cache.alloc(pool::buddy(), &pd.quota)?.cast::<Ec>();

        let fpu = match pd.fpu_cache.alloc(pool::buddy(), &pd.quota) {
            Some(fpu) => {
                let fpu = fpu.cast::<Fpu>();
                unsafe { fpu.as_ptr().write(Fpu { data: [0; 512] }) };
                Some(fpu)
            }
            None => {
                unsafe { pd.ec_cache.free(raw.cast()) };
                return None;
            }
        };

        let ec = Ec {
            kobj: Kobject::new(raw.as_ptr() as *mut (), free_ec),
            pd: NonNull::from(pd),
            cpu,
            utcb,
            evt,
            regs: Mutex::new(SysRegs {
                args: [0; 5],
                status: Status::Success,
                si_value: 0,
                si_count: 0,
            }),
            cont: Mutex::new(None),
            sc: AtomicPtr::new(core::ptr::null_mut()),
            partner: AtomicPtr::new(core::ptr::null_mut()),
            blocked: AtomicBool::new(false),
            tsc_offset: AtomicI64::new(0),
            fpu,
        };

        unsafe { raw.as_ptr().write(ec) };

        if !pd.mem.insert_utcb(pd, utcb, utcb) {
            unsafe { destroy(raw) };
            return None;
        }

        Some(raw)
    }

    pub fn pd(&self) -> &Pd {
        unsafe { self.pd.as_ref() }
    }

    pub fn bind_sc(&self, sc: NonNull<Sc>) {
        self.sc.store(sc.as_ptr(), SeqCst);
    }

    pub fn sc(&self) -> Option<NonNull<Sc>> {
        NonNull::new(self.sc.load(SeqCst))
    }

    pub fn with_regs<R>(&self, f: impl FnOnce(&mut SysRegs) -> R) -> R {
        f(&mut self.regs.lock())
    }

    pub fn set_status(&self, status: Status) {
        self.regs.lock().status = status;
    }

    /// Deliver a signal info into the registers the EC wakes up with.
    pub fn set_si_regs(&self, value: usize, count: usize) {
        let mut regs = self.regs.lock();
        regs.si_value = value;
        regs.si_count = count;
    }

    pub fn set_partner(&self, partner: Option<NonNull<Ec>>) {
        self.partner.store(partner.map_or(core::ptr::null_mut(), |p| p.as_ptr()), SeqCst);
    }

    pub fn partner(&self) -> Option<NonNull<Ec>> {
        NonNull::new(self.partner.load(SeqCst))
    }

    pub fn set_blocked(&self) {
        self.blocked.store(true, SeqCst);
    }

    pub fn blocked(&self) -> bool {
        self.blocked.load(SeqCst)
    }

    /// Wake the EC: install the continuation and put its scheduling
    /// context back on the ready queue. A wakeup always cancels the wait
    /// timeout; a woken EC resumes through its continuation, so the
    /// cleanup after block_sc() only runs on the raced early return.
    pub fn release(&self, cont: Option<Continuation>) {
        if let Some(cont) = cont {
            *self.cont.lock() = Some(cont);
        }

        self.clr_timeout();
        self.blocked.store(false, SeqCst);

        if let Some(sc) = self.sc() {
            unsafe { sc.as_ref() }.remote_enqueue(true);
        }
    }

    /// Give up the CPU until released. Returns immediately if a wakeup
    /// already happened.
    pub fn block_sc(&self) {
        if !self.blocked.load(SeqCst) {
            return;
        }

        Sc::schedule(true, true);
    }

    pub fn set_timeout(&self, time: u64, sm: NonNull<crate::process::sm::Sm>) {
        if time != 0 {
            timer::set_timeout(EcPtr(NonNull::from(self)), time, sm);
        }
    }

    pub fn clr_timeout(&self) {
        timer::clr_timeout(EcPtr(NonNull::from(self)));
    }

    /// Charge descheduled wall-clock time to the EC's TSC offset.
    pub fn add_tsc_offset(&self, delta: i64) {
        self.tsc_offset.fetch_add(delta, SeqCst);
    }

    pub fn tsc_offset(&self) -> i64 {
        self.tsc_offset.load(SeqCst)
    }

    /// Enter this EC on the executing CPU: run its pending continuation,
    /// or hand the CPU back to user mode.
    pub fn activate(&self) -> ! {
        set_current(self);
        Pd::make_current(self.pd);

        let cont = self.cont.lock().take();
        match cont {
            Some(cont) => cont(),
            None => return_to_user(),
        }
    }
}

/// Architectural return path; register restore lives in the boot layer.
/// Doubles as the idle loop, which is a natural quiescent point.
fn return_to_user() -> ! {
    loop {
        rcu::quiet();
        x86_64::instructions::interrupts::enable_and_hlt();

        if cpu::chk_hazard(cpu::HZD_SCHED) {
            cpu::clr_hazard(cpu::HZD_SCHED);
            Sc::schedule(false, false);
        }
    }
}

pub fn current() -> Option<&'static Ec> {
    NonNull::new(CURRENT[cpu::id()].load(SeqCst)).map(|ec| unsafe { ec.as_ref() })
}

pub fn set_current(ec: &Ec) {
    CURRENT[cpu::id()].store(ec as *const Ec as *mut Ec, SeqCst);
}

/// Cancel outstanding wakeup sources when the EC's capability is revoked.
pub fn pre_free(ec: &Ec) {
    ec.clr_timeout();
    ec.blocked.store(false, SeqCst);
}

pub unsafe fn destroy(ec: NonNull<Ec>) {
    let e = unsafe { ec.as_ref() };
    let pd = e.pd();

    // A handler dying mid-rendezvous still holds its parked caller.
    if let Some(partner) = e.partner() {
        let partner = unsafe { partner.as_ref() };
        if partner.kobj.del_rcu() {
            rcu::call(&partner.kobj.rcu);
        }
    }

    pd.mem.remove_utcb(e.utcb);

    if let Some(fpu) = e.fpu {
        unsafe { pd.fpu_cache.free(fpu.cast()) };
    }

    unsafe {
        core::ptr::drop_in_place(ec.as_ptr());
        pd.ec_cache.free(ec.cast());
    }
}
