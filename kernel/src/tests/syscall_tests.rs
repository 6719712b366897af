/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: syscall_tests                                                   ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Hypercall dispatch: object creation through the decoded         ║
   ║         argument views, capability checks and revocation of object      ║
   ║         capabilities.                                                   ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Michael Schoettner, HHU                                         ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::process::pd;
use crate::rcu;
use crate::syscall::syscall_dispatcher;
use log::info;
use syscall::{Crd, CrdKind, Hypercall, Status};

const SEL_SM: usize = 0x40;
const SEL_PD: usize = 0x41;

fn invoke(call: Hypercall, sel: usize, flags: usize, args: [usize; 4]) -> (Status, [usize; 5]) {
    let mut words = [(sel << 8) | (flags & 0xff), args[0], args[1], args[2], args[3]];
    let status = syscall_dispatcher::handle(call as usize, &mut words);
    (status, words)
}

pub fn run() {
    test_create_and_ctrl();
    test_bad_cap();
    test_misc();
    test_revoke_object();

    info!("   test 'syscall':  passed");
}

fn test_misc() {
    // Lookup reports the live mapping behind a capability.
    let base = crate::memory::pool::base_page();
    let crd = Crd::new(CrdKind::Mem, base, 0, 0x1f);
    let (status, words) = invoke(Hypercall::Misc, 0, 0, [crd.raw(), 0, 0, 0]);
    assert_eq!(status, Status::Success);
    assert_ne!(Crd::from_raw(words[1]).kind(), CrdKind::Null);
    assert_eq!(Crd::from_raw(words[1]).attr(), 0x1f);

    // Suspend is refused while no sleep registers are known.
    let (status, _) = invoke(Hypercall::Misc, 0, 2, [0, 0, 0, 0]);
    assert_eq!(status, Status::BadFtr);

    // Binding a GSI to a semaphore.
    let (status, _) = invoke(Hypercall::AssignGsi, SEL_SM, 0, [7, 0, 0, 0]);
    assert_eq!(status, Status::Success);
}

fn test_create_and_ctrl() {
    // A semaphore created through the hypercall path lands in the
    // caller's object space.
    let (status, _) = invoke(Hypercall::CreateSm, SEL_SM, 0, [0, 2, 0, 0]);
    assert_eq!(status, Status::Success);
    assert!(pd::current().obj.lookup(SEL_SM).is_some());

    // The same selector cannot be taken twice.
    let (status, _) = invoke(Hypercall::CreateSm, SEL_SM, 0, [0, 0, 0, 0]);
    assert_eq!(status, Status::BadCap);

    // Up through sm_ctrl.
    let (status, _) = invoke(Hypercall::SmCtrl, SEL_SM, 0, [0, 0, 0, 0]);
    assert_eq!(status, Status::Success);

    // Quota introspection through pd_ctrl.
    let (status, _) = invoke(Hypercall::CreatePd, SEL_PD, 0, [8, 0, 0, 0]);
    assert_eq!(status, Status::Success);

    let (status, words) = invoke(Hypercall::PdCtrl, SEL_PD, 0x2, [0, 0, 0, 0]);
    assert_eq!(status, Status::Success);
    assert_eq!(words[1], 8);
}

fn test_bad_cap() {
    // Unknown selectors and wrong object kinds are refused.
    let (status, _) = invoke(Hypercall::SmCtrl, 0x7777, 0, [0, 0, 0, 0]);
    assert_eq!(status, Status::BadCap);

    let (status, _) = invoke(Hypercall::PtCtrl, SEL_SM, 0, [1, 0, 0, 0]);
    assert_eq!(status, Status::BadCap);

    let (status, _) = invoke(Hypercall::CreateSm, 0x7778, 0, [0x7777, 0, 0, 0]);
    assert_eq!(status, Status::BadCap);
}

fn test_revoke_object() {
    let crd = Crd::new(CrdKind::Obj, SEL_SM, 0, 0x1f);
    let (status, _) = invoke(Hypercall::Revoke, 0, syscall::flags::REVOKE_SELF, [crd.raw(), 0, 0, 0]);
    assert_eq!(status, Status::Success);

    // The capability is gone; further control calls are refused.
    assert!(pd::current().obj.lookup(SEL_SM).is_none());
    let (status, _) = invoke(Hypercall::SmCtrl, SEL_SM, 0, [0, 0, 0, 0]);
    assert_eq!(status, Status::BadCap);

    rcu::quiet();
}
