/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: sm                                                              ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Semaphores: a counter, a queue of blocked execution contexts and a      ║
   ║ queue of pending signal infos. A semaphore doubles as a signal info     ║
   ║ itself, carrying a value that up() can piggyback onto another           ║
   ║ semaphore and that dn() delivers into the waiter's registers.           ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, HHU                                             ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::memory::pool;
use crate::process::ec::{Continuation, Ec, EcPtr};
use crate::process::pd::Pd;
use crate::process::sc::Sc;
use crate::process::Kobject;
use crate::rcu;
use crate::syscall::sys_finish_bad_cap;
use alloc::collections::VecDeque;
use core::ptr::NonNull;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering::SeqCst;
use spin::Mutex;

#[derive(Copy, Clone)]
pub struct SmPtr(pub NonNull<Sm>);

unsafe impl Send for SmPtr {}
unsafe impl Sync for SmPtr {}

struct SmState {
    counter: usize,
    waiters: VecDeque<EcPtr>,
    signals: VecDeque<SmPtr>,
}

pub struct Sm {
    pub kobj: Kobject,
    pd: NonNull<Pd>,
    state: Mutex<SmState>,

    /// Payload delivered when this semaphore acts as a signal info.
    pub si_value: usize,
    si_queued: AtomicBool,
}

unsafe impl Send for Sm {}
unsafe impl Sync for Sm {}

unsafe fn free_sm(obj: *mut ()) {
    unsafe { destroy(NonNull::new_unchecked(obj as *mut Sm)) };
}

impl Sm {
    pub fn create(pd: &Pd, counter: usize, si_value: usize) -> Option<NonNull<Sm>> {
        let raw = pd.sm_cache.alloc(pool::buddy(), &pd.quota)?.cast::<Sm>();

        let sm = Sm {
            kobj: Kobject::new(raw.as_ptr() as *mut (), free_sm),
            pd: NonNull::from(pd),
            state: Mutex::new(SmState {
                counter,
                waiters: VecDeque::new(),
                signals: VecDeque::new(),
            }),
            si_value,
            si_queued: AtomicBool::new(false),
        };

        unsafe { raw.as_ptr().write(sm) };
        Some(raw)
    }

    pub fn counter(&self) -> usize {
        self.state.lock().counter
    }

    /// Consume the counter, returning the drained count.
    pub fn reset(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.counter;
        state.counter = 0;
        count
    }

    /// Down operation. A positive counter is consumed (entirely with
    /// `zero`) and a pending signal info is delivered without blocking.
    /// Otherwise the EC parks on the waiter queue; with `block` it gives
    /// up the CPU until up(), a timeout or revocation releases it.
    pub fn dn(&self, zero: bool, timeout: u64, ec: &Ec, block: bool) {
        let consumed = {
            let mut state = self.state.lock();

            if state.counter > 0 {
                state.counter = if zero { 0 } else { state.counter - 1 };
                Some(state.signals.pop_front())
            } else {
                if !ec.kobj.add_ref() {
                    drop(state);
                    Sc::schedule(block, true);
                }

                ec.set_blocked();
                state.waiters.push_back(EcPtr(NonNull::from(ec)));
                None
            }
        };

        // Delivered without the state lock; the signal may be this very
        // semaphore.
        if let Some(signal) = consumed {
            if let Some(si) = signal {
                let signal = unsafe { si.0.as_ref() };
                signal.si_queued.store(false, SeqCst);
                ec.set_si_regs(signal.si_value, signal.reset());
            }

            return;
        }

        if !block {
            Sc::schedule(false, true);
        }

        ec.set_timeout(timeout, NonNull::from(self));

        ec.block_sc();

        ec.clr_timeout();
    }

    /// Up operation: wake the head waiter, delivering `si` into its
    /// registers, or bank the signal/count if nobody waits. Dead waiters
    /// are reaped and the next one is woken instead.
    pub fn up(&self, cont: Option<Continuation>, si: Option<&Sm>) {
        loop {
            let waiter = {
                let mut state = self.state.lock();

                match state.waiters.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        if let Some(si) = si {
                            if si.si_queued.swap(true, SeqCst) {
                                return;
                            }
                            state.signals.push_back(SmPtr(NonNull::from(si)));
                        }

                        state.counter += 1;
                        return;
                    }
                }
            };

            let ec = unsafe { waiter.0.as_ref() };

            if let Some(si) = si {
                ec.set_si_regs(si.si_value, si.reset());
            }

            ec.release(cont);

            if !ec.kobj.del_rcu() {
                return;
            }

            // The waiter died while blocked; reclaim it and wake the next.
            rcu::call(&ec.kobj.rcu);
        }
    }

    /// Timeout path: drop the EC from the waiter queue (if it still is
    /// queued) and release it with a timeout continuation. An EC woken by
    /// up() can no longer be found here, so it never wakes twice.
    pub fn timeout(&self, ec: &Ec) {
        {
            let mut state = self.state.lock();

            let Some(position) = state
                .waiters
                .iter()
                .position(|waiter| core::ptr::eq(waiter.0.as_ptr(), ec))
            else {
                return;
            };

            state.waiters.remove(position);
        }

        ec.release(Some(crate::syscall::sys_finish_com_tim));

        if ec.kobj.del_rcu() {
            rcu::call(&ec.kobj.rcu);
        }
    }

    /// Drain all waiters with a BAD_CAP continuation; runs when the
    /// semaphore's capability is revoked. The counter going positive
    /// means nobody is left to wake.
    pub fn drain(&self) {
        while self.counter() == 0 {
            self.up(Some(sys_finish_bad_cap), None);
        }
    }
}

pub unsafe fn destroy(sm: NonNull<Sm>) {
    let s = unsafe { sm.as_ref() };
    s.drain();

    let pd = unsafe { s.pd.as_ref() };

    unsafe {
        core::ptr::drop_in_place(sm.as_ptr());
        pd.sm_cache.free(sm.cast());
    }
}
