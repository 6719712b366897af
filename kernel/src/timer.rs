/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: timer                                                           ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Per-CPU deadline bookkeeping: the scheduler's budget deadline and the   ║
   ║ semaphore wait timeouts. The LAPIC one-shot timer is armed for the      ║
   ║ earliest pending deadline; the tick handler releases expired waiters    ║
   ║ with a timeout status and raises the scheduling hazard when the         ║
   ║ running context's budget is gone.                                       ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Michael Schoettner, Univ. Duesseldorf                           ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::consts::MAX_CPUS;
use crate::device::cpu;
use crate::device::cpu::HZD_SCHED;
use crate::device::lapic;
use crate::process::ec::EcPtr;
use crate::process::sm::{Sm, SmPtr};
use alloc::vec::Vec;
use core::ptr::NonNull;
use spin::Mutex;

struct Timeout {
    time: u64,
    ec: EcPtr,
    sm: SmPtr,
}

struct TimerState {
    /// Absolute TSC deadline of the running context's budget; zero until
    /// the first schedule.
    budget: u64,
    timeouts: Vec<Timeout>,
}

static STATE: [Mutex<TimerState>; MAX_CPUS] = [const {
    Mutex::new(TimerState {
        budget: 0,
        timeouts: Vec::new(),
    })
}; MAX_CPUS];

/// Remove and return the budget deadline; the scheduler turns it into the
/// time the descheduled context has left.
pub fn budget_dequeue(cpu: usize) -> u64 {
    let mut state = STATE[cpu].lock();
    let deadline = state.budget;
    state.budget = 0;
    deadline
}

/// Arm the budget deadline for the context about to run.
pub fn budget_enqueue(cpu: usize, deadline: u64) {
    {
        let mut state = STATE[cpu].lock();
        state.budget = deadline;
    }

    rearm(cpu);
}

/// Register a semaphore wait timeout for `ec` at absolute TSC `time`.
pub fn set_timeout(ec: EcPtr, time: u64, sm: NonNull<Sm>) {
    let cpu = unsafe { ec.0.as_ref() }.cpu;

    {
        let mut state = STATE[cpu].lock();
        state.timeouts.retain(|timeout| timeout.ec != ec);
        state.timeouts.push(Timeout { time, ec, sm: SmPtr(sm) });
    }

    rearm(cpu);
}

pub fn clr_timeout(ec: EcPtr) {
    let cpu = unsafe { ec.0.as_ref() }.cpu;
    STATE[cpu].lock().timeouts.retain(|timeout| timeout.ec != ec);
}

/// Timer interrupt: fire expired wait timeouts and check the budget.
pub fn tick() {
    let cpu = cpu::id();
    let now = cpu::rdtsc();

    let expired: Vec<(EcPtr, SmPtr)> = {
        let mut state = STATE[cpu].lock();

        if state.budget != 0 && now >= state.budget {
            cpu::set_hazard(HZD_SCHED);
        }

        let mut expired = Vec::new();
        state.timeouts.retain(|timeout| {
            if now >= timeout.time {
                expired.push((timeout.ec, timeout.sm));
                false
            } else {
                true
            }
        });
        expired
    };

    // Released outside the lock; the semaphore path takes its own.
    for (ec, sm) in expired {
        unsafe { sm.0.as_ref().timeout(ec.0.as_ref()) };
    }

    rearm(cpu);
}

/// Number of registered wait timeouts on a CPU; used by the boot self
/// tests to check that wakeups cancel their deadline.
pub fn pending(cpu: usize) -> usize {
    STATE[cpu].lock().timeouts.len()
}

/// Point the LAPIC one-shot timer at the earliest pending deadline.
fn rearm(cpu: usize) {
    let state = STATE[cpu].lock();

    let mut next = state.budget;
    for timeout in state.timeouts.iter() {
        if next == 0 || (timeout.time != 0 && timeout.time < next) {
            next = timeout.time;
        }
    }

    if next == 0 {
        return;
    }

    let now = cpu::rdtsc();
    let delta = next.saturating_sub(now).max(1);
    lapic::set_oneshot(delta.min(u32::MAX as u64) as u32);
}
