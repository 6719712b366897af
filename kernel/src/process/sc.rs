/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: sc                                                              ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Scheduling contexts and the per-CPU scheduler: strict priorities,       ║
   ║ budget preservation across preemption and remote enqueue via IPI.       ║
   ║                                                                         ║
   ║ Each CPU owns an array of priority queues plus a remote-run queue       ║
   ║ other CPUs push into. A scheduling context carries the TSC budget of    ║
   ║ its execution context; what is left of the budget survives             ║
   ║ preemption (use_left) and is reloaded only when exhausted.              ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, Univ. Duesseldorf                               ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::consts::{MAX_CPUS, PRIORITIES};
use crate::device::cpu;
use crate::device::cpu::HZD_SCHED;
use crate::device::lapic;
use crate::interrupt::interrupt_dispatcher::{VEC_IPI_RKE, VEC_IPI_RRQ};
use crate::memory::pool;
use crate::process::ec;
use crate::process::ec::Ec;
use crate::process::pd;
use crate::process::pd::Pd;
use crate::process::Kobject;
use crate::rcu;
use crate::sync::irqsave_spinlock::IrqSaveSpinlock;
use crate::timer;
use alloc::collections::VecDeque;
use core::ptr;
use core::ptr::NonNull;
use core::sync::atomic::Ordering::SeqCst;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64};
use spin::Mutex;

pub struct Sc {
    pub kobj: Kobject,
    ec: NonNull<Ec>,
    pub cpu: usize,
    pub prio: usize,
    pub budget: u64,

    left: AtomicU64,
    time: AtomicU64,
    tsc: AtomicU64,
    pub disable: AtomicBool,
}

unsafe impl Send for Sc {}
unsafe impl Sync for Sc {}

#[derive(Copy, Clone)]
pub struct ScPtr(pub NonNull<Sc>);

unsafe impl Send for ScPtr {}
unsafe impl Sync for ScPtr {}

struct ReadyState {
    list: [VecDeque<ScPtr>; PRIORITIES],
    prio_top: usize,
}

static READY: [IrqSaveSpinlock<ReadyState>; MAX_CPUS] = [const {
    IrqSaveSpinlock::new(ReadyState {
        list: [const { VecDeque::new() }; PRIORITIES],
        prio_top: 0,
    })
}; MAX_CPUS];

/// Remote-run queues, filled by other CPUs and drained by the RRQ IPI
/// handler.
static RQ: [Mutex<VecDeque<ScPtr>>; MAX_CPUS] = [const { Mutex::new(VecDeque::new()) }; MAX_CPUS];

static CURRENT: [AtomicPtr<Sc>; MAX_CPUS] = [const { AtomicPtr::new(ptr::null_mut()) }; MAX_CPUS];

unsafe fn free_sc(obj: *mut ()) {
    unsafe { destroy(NonNull::new_unchecked(obj as *mut Sc)) };
}

impl Sc {
    /// Allocate a scheduling context bound to `ec`. `quantum` is in
    /// microseconds and becomes a TSC budget.
    pub fn create(pd: &Pd, ec_ptr: NonNull<Ec>, cpu: usize, prio: usize, quantum: usize) -> Option<NonNull<Sc>> {
        assert!(prio < PRIORITIES);

        let raw = pd.sc_cache.alloc(pool::buddy(), &pd.quota)?.cast::<Sc>();

        let e = unsafe { ec_ptr.as_ref() };
        if !e.kobj.add_ref() {
            unsafe { pd.sc_cache.free(raw.cast()) };
            return None;
        }

        let sc = Sc {
            kobj: Kobject::new(raw.as_ptr() as *mut (), free_sc),
            ec: ec_ptr,
            cpu,
            prio,
            budget: lapic::freq_khz() * quantum as u64 / 1000,
            left: AtomicU64::new(0),
            time: AtomicU64::new(0),
            tsc: AtomicU64::new(0),
            disable: AtomicBool::new(false),
        };

        unsafe { raw.as_ptr().write(sc) };
        e.bind_sc(raw);

        Some(raw)
    }

    pub fn ec_ref(&self) -> &Ec {
        unsafe { self.ec.as_ref() }
    }

    pub fn left(&self) -> u64 {
        self.left.load(SeqCst)
    }

    /// Consumed CPU time in TSC ticks; exposed through sc_ctrl.
    pub fn time(&self) -> u64 {
        self.time.load(SeqCst)
    }

    /// Put the context on the executing CPU's ready queue.
    ///
    /// With `use_left` and remaining budget, the context goes to the head
    /// of its ring so the interrupted quantum holder continues first. An
    /// exhausted budget is reloaded here.
    pub fn ready_enqueue(&self, t: u64, inc_ref: bool, use_left: bool) {
        assert!(self.prio < PRIORITIES);
        assert_eq!(self.cpu, cpu::id(), "enqueue on a foreign CPU");

        if inc_ref && !self.kobj.add_ref() {
            return;
        }

        {
            let mut state = READY[self.cpu].lock();

            if self.prio > state.prio_top {
                state.prio_top = self.prio;
            }

            let entry = ScPtr(NonNull::from(self));
            if use_left && self.left() > 0 {
                state.list[self.prio].push_front(entry);
            } else {
                state.list[self.prio].push_back(entry);
            }
        }

        if let Some(cur) = current() {
            if self.prio > cur.prio || (!ptr::eq(self, cur) && self.prio == cur.prio && use_left && self.left() > 0) {
                cpu::set_hazard(HZD_SCHED);
            }
        }

        if self.left() == 0 {
            self.left.store(self.budget, SeqCst);
        }

        self.tsc.store(t, SeqCst);
    }

    /// Take the context off the ready queue, charging the wall-clock time
    /// it spent enqueued to its EC's TSC offset.
    pub fn ready_dequeue(&self, t: u64) {
        assert!(self.prio < PRIORITIES);
        assert_eq!(self.cpu, cpu::id(), "dequeue on a foreign CPU");

        {
            let mut state = READY[self.cpu].lock();

            let position = state.list[self.prio]
                .iter()
                .position(|entry| ptr::eq(entry.0.as_ptr(), self))
                .expect("scheduling context is not enqueued");
            state.list[self.prio].remove(position);

            while state.prio_top > 0 && state.list[state.prio_top].is_empty() {
                state.prio_top -= 1;
            }
        }

        self.ec_ref().add_tsc_offset(self.tsc.load(SeqCst) as i64 - t as i64);
        self.tsc.store(t, SeqCst);
    }

    /// Select the next scheduling context and enter its EC. `suspend`
    /// keeps the current context off the ready queue (it blocked or
    /// died); contexts whose EC has been disabled are dropped on the way.
    pub fn schedule(mut suspend: bool, use_left: bool) -> ! {
        let cpu_id = cpu::id();

        loop {
            rcu::quiet();

            let cur = current().expect("schedule without a current scheduling context");

            let t = cpu::rdtsc();
            let d = timer::budget_dequeue(cpu_id);

            cur.time.fetch_add(t.wrapping_sub(cur.tsc.load(SeqCst)), SeqCst);
            cur.left.store(d.saturating_sub(t), SeqCst);

            cpu::clr_hazard(HZD_SCHED);

            if cur.disable.load(SeqCst) && ec::current().map(|e| ptr::eq(e, cur.ec_ref())).unwrap_or(false) {
                suspend = true;
            }

            if !suspend {
                cur.ready_enqueue(t, false, use_left);
            } else if cur.kobj.del_rcu() {
                rcu::call(&cur.kobj.rcu);
            }

            let next = {
                let state = READY[cpu_id].lock();
                let top = state.prio_top;
                state.list[top].front().copied().expect("ready queue is empty")
            };
            let next_ref = unsafe { next.0.as_ref() };

            timer::budget_enqueue(cpu_id, t + next_ref.left());

            CURRENT[cpu_id].store(next.0.as_ptr(), SeqCst);
            next_ref.ready_dequeue(t);

            if !(next_ref.disable.load(SeqCst) && ec::current().map(|e| ptr::eq(e, next_ref.ec_ref())).unwrap_or(false)) {
                next_ref.ec_ref().activate();
            }

            suspend = true;
        }
    }

    /// Enqueue on the context's home CPU; from a foreign CPU the context
    /// goes through the remote-run queue and an RRQ IPI if the queue was
    /// empty.
    pub fn remote_enqueue(&self, inc_ref: bool) {
        if cpu::id() == self.cpu {
            self.ready_enqueue(cpu::rdtsc(), inc_ref, true);
            return;
        }

        if inc_ref && !self.kobj.add_ref() {
            return;
        }

        let was_empty = {
            let mut queue = RQ[self.cpu].lock();
            let was_empty = queue.is_empty();
            queue.push_back(ScPtr(NonNull::from(self)));
            was_empty
        };

        if was_empty {
            lapic::send_ipi(self.cpu, VEC_IPI_RRQ);
        }
    }
}

/// Drain the remote-run queue into the local ready queues.
pub fn rrq_handler() {
    let t = cpu::rdtsc();
    let cpu_id = cpu::id();

    loop {
        let entry = RQ[cpu_id].lock().pop_front();
        let Some(entry) = entry else {
            break;
        };

        unsafe { entry.0.as_ref() }.ready_enqueue(t, false, true);
    }
}

/// Kick handler: a reschedule is due if the running context has been
/// disabled or a TLB shootdown is pending for the active domain.
pub fn rke_handler() {
    if let Some(cur) = current() {
        if cur.disable.load(SeqCst) {
            cpu::set_hazard(HZD_SCHED);
        }
    }

    if pd::current().mem.htlb.chk(cpu::id()) {
        cpu::set_hazard(HZD_SCHED);
    }
}

/// Deschedule a dying context: locally via the hazard, remotely via an
/// RKE IPI.
pub fn pre_free(sc: &Sc) {
    sc.disable.store(true, SeqCst);

    if current().map(|cur| ptr::eq(cur, sc)).unwrap_or(false) {
        cpu::set_hazard(HZD_SCHED);
    } else if sc.cpu != cpu::id() {
        lapic::send_ipi(sc.cpu, VEC_IPI_RKE);
    }
}

pub fn current() -> Option<&'static Sc> {
    NonNull::new(CURRENT[cpu::id()].load(SeqCst)).map(|sc| unsafe { sc.as_ref() })
}

/// Install the boot CPU's idle context as current without enqueueing it.
pub fn set_current_boot(sc: NonNull<Sc>) {
    CURRENT[cpu::id()].store(sc.as_ptr(), SeqCst);
}

pub unsafe fn destroy(sc: NonNull<Sc>) {
    let s = unsafe { sc.as_ref() };
    let e = s.ec_ref();
    let pd = e.pd();

    if e.kobj.del_ref() {
        unsafe { ec::destroy(NonNull::from(e)) };
    }

    unsafe {
        core::ptr::drop_in_place(sc.as_ptr());
        pd.sc_cache.free(sc.cast());
    }
}

/// Snapshot of one priority ring, used by the boot self tests.
pub fn ready_snapshot(cpu: usize, prio: usize) -> alloc::vec::Vec<*const Sc> {
    let state = READY[cpu].lock();
    state.list[prio].iter().map(|entry| entry.0.as_ptr() as *const Sc).collect()
}

pub fn prio_top(cpu: usize) -> usize {
    READY[cpu].lock().prio_top
}
