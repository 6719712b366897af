/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: rcu                                                             ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Grace-period deferred reclamation. Objects reachable from a mapping     ║
   ║ tree or a ready queue are freed only after every online CPU has         ║
   ║ passed a quiescent state (returned to user mode or idled), which the    ║
   ║ scheduler reports at each scheduling boundary.                          ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Michael Schoettner, Univ. Duesseldorf                           ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::consts::MAX_CPUS;
use crate::device::cpu;
use alloc::collections::VecDeque;
use core::ptr::NonNull;
use core::sync::atomic::Ordering::SeqCst;
use core::sync::atomic::{AtomicBool, AtomicUsize};
use spin::Mutex;

/// Embedded in every object that can be handed to [`call`]. The free
/// function runs after a full grace period.
pub struct RcuHead {
    queued: AtomicBool,
    obj: *mut (),
    func: unsafe fn(*mut ()),
}

unsafe impl Send for RcuHead {}
unsafe impl Sync for RcuHead {}

unsafe fn noop(_: *mut ()) {}

impl RcuHead {
    pub const fn empty() -> Self {
        Self {
            queued: AtomicBool::new(false),
            obj: core::ptr::null_mut(),
            func: noop,
        }
    }

    pub fn new(obj: *mut (), func: unsafe fn(*mut ())) -> Self {
        Self {
            queued: AtomicBool::new(false),
            obj,
            func,
        }
    }
}

struct Deferred {
    epoch: usize,
    head: NonNull<RcuHead>,
}

unsafe impl Send for Deferred {}

static EPOCH: AtomicUsize = AtomicUsize::new(1);
static QUIESCENT: [AtomicUsize; MAX_CPUS] = [const { AtomicUsize::new(0) }; MAX_CPUS];
static BATCHES: [Mutex<VecDeque<Deferred>>; MAX_CPUS] = [const { Mutex::new(VecDeque::new()) }; MAX_CPUS];

/// Defer the head's free function past the current grace period.
/// Returns false if it is already queued.
pub fn call(head: &RcuHead) -> bool {
    if head.queued.swap(true, SeqCst) {
        return false;
    }

    let deferred = Deferred {
        epoch: EPOCH.load(SeqCst),
        head: NonNull::from(head),
    };

    BATCHES[cpu::id()].lock().push_back(deferred);
    true
}

/// Report a quiescent state for the executing CPU and run every local
/// callback whose grace period has passed.
pub fn quiet() {
    let cpu = cpu::id();
    let epoch = EPOCH.load(SeqCst);
    QUIESCENT[cpu].store(epoch, SeqCst);

    // The epoch advances once every online CPU has quiesced in it.
    let mut all_quiet = true;
    for other in 0..MAX_CPUS {
        if cpu::online(other) && QUIESCENT[other].load(SeqCst) < epoch {
            all_quiet = false;
            break;
        }
    }

    if all_quiet {
        let _ = EPOCH.compare_exchange(epoch, epoch + 1, SeqCst, SeqCst);
    }

    // Callbacks enqueued in epoch e may run once the epoch has advanced
    // past e. Invoked without holding the batch lock, since a free
    // function may defer further objects.
    let now = EPOCH.load(SeqCst);
    loop {
        let deferred = {
            let mut batch = BATCHES[cpu].lock();
            match batch.front() {
                Some(first) if first.epoch < now => batch.pop_front(),
                _ => None,
            }
        };

        let Some(deferred) = deferred else {
            break;
        };

        let (obj, func) = unsafe {
            let head = deferred.head.as_ref();
            head.queued.store(false, SeqCst);
            (head.obj, head.func)
        };

        unsafe { func(obj) };
    }
}

/// Number of callbacks still waiting on this CPU; used by the boot self
/// tests to assert exactly-once reclamation.
pub fn pending() -> usize {
    BATCHES[cpu::id()].lock().len()
}
