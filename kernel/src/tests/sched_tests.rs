/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: sched_tests                                                     ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Ready queue behaviour: strict priority ordering, budget         ║
   ║         reload on exhaustion, head rotation for interrupted quantum     ║
   ║         holders and the reschedule hazard.                              ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Michael Schoettner, HHU                                         ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::device::cpu;
use crate::device::cpu::HZD_SCHED;
use crate::process::ec::Ec;
use crate::process::pd;
use crate::process::pd::Pd;
use crate::process::sc;
use crate::process::sc::Sc;
use core::ptr::NonNull;
use log::info;

fn new_sc(pd: &Pd, prio: usize) -> &'static Sc {
    let ec = Ec::create(pd, 0, 0, 0).expect("failed to create a test EC");
    let sc = Sc::create(pd, ec, 0, prio, 10_000).expect("failed to create a test SC");
    unsafe { &*sc.as_ptr() }
}

pub fn run() {
    test_priority_queues();
    test_budget_reload();
    test_use_left_rotation();

    info!("   test 'sched':    passed");
}

fn test_priority_queues() {
    let pd = unsafe { &*Pd::create(pd::root(), 32).unwrap().as_ptr() };
    let lo = new_sc(pd, 5);
    let hi = new_sc(pd, 10);

    let t = cpu::rdtsc();
    cpu::clr_hazard(HZD_SCHED);

    lo.ready_enqueue(t, true, false);
    assert_eq!(sc::prio_top(0), 5);

    // A higher priority than the running context raises the hazard.
    assert!(cpu::chk_hazard(HZD_SCHED), "higher-priority enqueue must set the hazard");
    cpu::clr_hazard(HZD_SCHED);

    hi.ready_enqueue(t, true, false);
    assert_eq!(sc::prio_top(0), 10);

    // FIFO within one priority.
    let lo2 = new_sc(pd, 5);
    lo2.ready_enqueue(t, true, false);
    let ring = sc::ready_snapshot(0, 5);
    assert_eq!(ring.len(), 2);
    assert!(core::ptr::eq(ring[0], lo));
    assert!(core::ptr::eq(ring[1], lo2));

    hi.ready_dequeue(t);
    assert_eq!(sc::prio_top(0), 5);

    lo.ready_dequeue(t);
    lo2.ready_dequeue(t);
    assert_eq!(sc::prio_top(0), 0);
    cpu::clr_hazard(HZD_SCHED);
}

fn test_budget_reload() {
    let pd = unsafe { &*Pd::create(pd::root(), 32).unwrap().as_ptr() };
    let sc = new_sc(pd, 3);

    assert_eq!(sc.left(), 0);

    // An exhausted budget is reloaded on enqueue.
    let t = cpu::rdtsc();
    sc.ready_enqueue(t, true, false);
    assert_eq!(sc.left(), sc.budget);

    sc.ready_dequeue(t);
    cpu::clr_hazard(HZD_SCHED);
}

fn test_use_left_rotation() {
    let pd = unsafe { &*Pd::create(pd::root(), 32).unwrap().as_ptr() };
    let first = new_sc(pd, 7);
    let second = new_sc(pd, 7);

    let t = cpu::rdtsc();
    first.ready_enqueue(t, true, false);

    // A preempted context with remaining budget continues before its
    // peers.
    second.ready_enqueue(t, true, false);
    second.ready_dequeue(t);
    assert!(second.left() > 0);
    second.ready_enqueue(t, true, true);

    let ring = sc::ready_snapshot(0, 7);
    assert_eq!(ring.len(), 2);
    assert!(core::ptr::eq(ring[0], second));
    assert!(core::ptr::eq(ring[1], first));

    first.ready_dequeue(t);
    second.ready_dequeue(t);
    cpu::clr_hazard(HZD_SCHED);
}
