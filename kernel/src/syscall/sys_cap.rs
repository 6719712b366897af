/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: sys_cap                                                         ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Capability hypercalls: revoke, the lookup/delegate/suspend      ║
   ║         multiplex and the device assignment calls.                      ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, HHU                                             ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::device::acpi::Acpi;
use crate::device::cpu;
use crate::device::cpu::HZD_OOM;
use crate::interrupt::interrupt_dispatcher;
use crate::process::pd;
use crate::process::sm::SmPtr;
use crate::syscall::syscall_dispatcher::{SysAssignGsi, SysAssignPci, SysMisc, SysRevoke};
use crate::syscall::{lookup_pd, lookup_sm};
use core::ptr::NonNull;
use syscall::crd::OBJ_CTRL;
use syscall::{MiscOp, Status};

pub fn sys_revoke(view: SysRevoke) -> Status {
    let target = if view.remote() {
        match lookup_pd(view.pd(), OBJ_CTRL) {
            Ok(pd) => pd,
            Err(status) => return status,
        }
    } else {
        pd::current()
    };

    target.rev_crd(view.crd(), view.this(), cpu::preemption(), view.keep());
    Status::Success
}

fn sys_lookup(mut view: SysMisc) -> Status {
    let mut crd = view.crd();
    pd::current().lookup_crd(&mut crd);
    view.set_crd(crd);
    Status::Success
}

fn sys_delegate(mut view: SysMisc) -> Status {
    let snd = match lookup_pd(view.pd_snd(), OBJ_CTRL) {
        Ok(pd) => pd,
        Err(status) => return status,
    };

    let dst = match lookup_pd(view.pd_dst(), OBJ_CTRL) {
        Ok(pd) => pd,
        Err(status) => return status,
    };

    let mut crd = view.crd();
    dst.del_crd(snd, view.window(), &mut crd, 0, view.hotspot());
    view.set_crd(crd);

    if cpu::chk_hazard(HZD_OOM) {
        cpu::clr_hazard(HZD_OOM);
        return Status::Ovrflow;
    }

    Status::Success
}

pub fn sys_misc(view: SysMisc) -> Status {
    match MiscOp::try_from(view.op()) {
        Ok(MiscOp::Lookup) => sys_lookup(view),
        Ok(MiscOp::Delegate) => sys_delegate(view),
        Ok(MiscOp::AcpiSuspend) => Acpi::suspend(view.sleep_type_a() as u16, view.sleep_type_b() as u16),
        Err(_) => Status::BadPar,
    }
}

pub fn sys_assign_pci(view: SysAssignPci) -> Status {
    let target = match lookup_pd(view.pd(), OBJ_CTRL) {
        Ok(pd) => pd,
        Err(status) => return status,
    };

    if view.dev() > u16::MAX as usize {
        return Status::BadPar;
    }

    target.assign_rid(view.dev() as u16);
    Status::Success
}

pub fn sys_assign_gsi(view: SysAssignGsi) -> Status {
    let sm = match lookup_sm(view.sm(), OBJ_CTRL) {
        Ok(sm) => sm,
        Err(status) => return status,
    };

    if view.cpu() >= crate::consts::MAX_CPUS {
        return Status::BadPar;
    }

    // The interrupt path holds a reference to the semaphore from now on.
    if !sm.kobj.add_ref() {
        return Status::BadCap;
    }

    let bound = interrupt_dispatcher::assign_gsi(
        view.gsi(),
        SmPtr(NonNull::from(sm)),
        view.cpu(),
        view.trg(),
        view.pol(),
    );

    if bound {
        Status::Success
    } else {
        let _ = sm.kobj.del_ref();
        Status::BadPar
    }
}
