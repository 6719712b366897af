/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: sm_tests                                                        ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Semaphore counter behaviour, signal-info piggybacking and       ║
   ║         timeout bookkeeping on the non-blocking paths.                  ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Michael Schoettner, HHU                                         ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::process::ec::Ec;
use crate::process::pd;
use crate::process::pd::Pd;
use crate::process::sm::Sm;
use log::info;

pub fn run() {
    test_counter();
    test_signal_info();
    test_timeout_noop();
    test_gsi_signal();

    info!("   test 'sm':       passed");
}

fn test_counter() {
    let pd = unsafe { &*Pd::create(pd::root(), 32).unwrap().as_ptr() };
    let sm = unsafe { &*Sm::create(pd, 1, 0).unwrap().as_ptr() };
    let ec = unsafe { &*Ec::create(pd, 0, 0, 0).unwrap().as_ptr() };

    // A positive counter satisfies the down without blocking.
    assert_eq!(sm.counter(), 1);
    sm.dn(false, 0, ec, false);
    assert_eq!(sm.counter(), 0);

    // Ups with nobody waiting bank the count.
    sm.up(None, None);
    sm.up(None, None);
    assert_eq!(sm.counter(), 2);

    // A zero-down drains everything at once.
    sm.dn(true, 0, ec, false);
    assert_eq!(sm.counter(), 0);
}

fn test_signal_info() {
    let pd = unsafe { &*Pd::create(pd::root(), 32).unwrap().as_ptr() };
    let sm = unsafe { &*Sm::create(pd, 0, 0).unwrap().as_ptr() };
    let si = unsafe { &*Sm::create(pd, 3, 0xcafe).unwrap().as_ptr() };
    let ec = unsafe { &*Ec::create(pd, 0, 0, 0).unwrap().as_ptr() };

    // The signal is banked with the count, and queueing it twice has no
    // effect.
    sm.up(None, Some(si));
    sm.up(None, Some(si));
    assert_eq!(sm.counter(), 1);

    // The next down consumes the signal into the waiter's registers,
    // draining the signal's own counter.
    sm.dn(false, 0, ec, false);
    ec.with_regs(|regs| {
        assert_eq!(regs.si_value, 0xcafe);
        assert_eq!(regs.si_count, 3);
    });
    assert_eq!(si.counter(), 0);
}

fn test_timeout_noop() {
    let pd = unsafe { &*Pd::create(pd::root(), 32).unwrap().as_ptr() };
    let sm = unsafe { &*Sm::create(pd, 0, 0).unwrap().as_ptr() };
    let ec = unsafe { &*Ec::create(pd, 0, 0, 0).unwrap().as_ptr() };

    // An EC that is not enqueued (already woken) must not be released a
    // second time by the timeout path.
    let refs = ec.kobj.ref_count();
    sm.timeout(ec);
    assert_eq!(ec.kobj.ref_count(), refs);

    // An expired deadline fires through the timer tick; the EC was never
    // blocked, so nothing is released, and the registration is gone.
    ec.set_timeout(1, core::ptr::NonNull::from(sm));
    crate::timer::tick();
    assert_eq!(ec.kobj.ref_count(), refs);
    ec.clr_timeout();

    // A wakeup cancels a pending deadline, so it can never fire against
    // a semaphore that goes away afterwards.
    ec.set_timeout(u64::MAX, core::ptr::NonNull::from(sm));
    assert_eq!(crate::timer::pending(0), 1);
    ec.release(None);
    assert_eq!(crate::timer::pending(0), 0);
}

/// A device interrupt vector signals the semaphore bound to its GSI.
fn test_gsi_signal() {
    use crate::interrupt::interrupt_dispatcher;
    use crate::interrupt::interrupt_dispatcher::VEC_GSI_BASE;
    use crate::process::sm::SmPtr;

    let pd = unsafe { &*Pd::create(pd::root(), 32).unwrap().as_ptr() };
    let sm = unsafe { &*Sm::create(pd, 0, 0x51).unwrap().as_ptr() };

    assert!(interrupt_dispatcher::assign_gsi(5, SmPtr(core::ptr::NonNull::from(sm)), 0, false, false));

    interrupt_dispatcher::dispatch(VEC_GSI_BASE + 5);
    assert_eq!(sm.counter(), 1);

    // The banked signal is delivered with the next down.
    let ec = unsafe { &*Ec::create(pd, 0, 0, 0).unwrap().as_ptr() };
    sm.dn(false, 0, ec, false);
    ec.with_regs(|regs| assert_eq!(regs.si_value, 0x51));
}
