/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: sys_create                                                      ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Object creation hypercalls. The new object lives in (and is     ║
   ║         charged to) the target domain; its root capability lands at     ║
   ║         the chosen selector in the caller's object space.               ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, HHU                                             ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::consts::{MAX_CPUS, PRIORITIES};
use crate::process::ec::Ec;
use crate::process::pd;
use crate::process::pd::Pd;
use crate::process::pt::Pt;
use crate::process::sc::Sc;
use crate::process::sm::Sm;
use crate::space::space_obj::CapObj;
use crate::syscall::{lookup_ec, lookup_pd};
use crate::syscall::syscall_dispatcher::{SysCreateEc, SysCreatePd, SysCreatePt, SysCreateSc, SysCreateSm};
use core::ptr::NonNull;
use syscall::crd::{ATTR_FULL, OBJ_CTRL};
use syscall::{CrdKind, Status};

/// Install the root capability for a new object in the caller's object
/// space; tears the object down again if the selector is taken.
fn install_root(sel: usize, obj: CapObj) -> Status {
    let current = pd::current();

    if current.obj.insert_root(current, sel, ATTR_FULL, obj) {
        Status::Success
    } else {
        crate::space::space_obj::object_release(obj);
        Status::BadCap
    }
}

pub fn sys_create_pd(view: SysCreatePd) -> Status {
    let current = pd::current();

    let Some(new_pd) = Pd::create(current, view.limit()) else {
        return Status::Ovrflow;
    };

    let status = install_root(view.sel(), CapObj::Pd(new_pd));
    if status != Status::Success {
        return status;
    }

    // Initial delegation into the fresh domain.
    let crd = view.crd();
    if crd.kind() != CrdKind::Null {
        let mut xfer = crd;
        unsafe { new_pd.as_ref() }.del_crd(current, crd, &mut xfer, 0, crd.base());
    }

    Status::Success
}

pub fn sys_create_ec(view: SysCreateEc) -> Status {
    if view.cpu() >= MAX_CPUS {
        return Status::BadPar;
    }

    let target = match lookup_pd(view.pd(), OBJ_CTRL) {
        Ok(pd) => pd,
        Err(status) => return status,
    };

    let Some(ec) = Ec::create(target, view.cpu(), view.utcb() >> 12, view.evt()) else {
        return Status::Ovrflow;
    };

    install_root(view.sel(), CapObj::Ec(ec))
}

pub fn sys_create_sc(view: SysCreateSc) -> Status {
    let target = match lookup_pd(view.pd(), OBJ_CTRL) {
        Ok(pd) => pd,
        Err(status) => return status,
    };

    let ec = match lookup_ec(view.ec(), OBJ_CTRL) {
        Ok(ec) => ec,
        Err(status) => return status,
    };

    let qpd = view.qpd();
    if qpd.prio() >= PRIORITIES || qpd.quantum() == 0 {
        return Status::BadPar;
    }

    let Some(sc) = Sc::create(target, NonNull::from(ec), ec.cpu, qpd.prio(), qpd.quantum()) else {
        return Status::Ovrflow;
    };

    let status = install_root(view.sel(), CapObj::Sc(sc));
    if status != Status::Success {
        return status;
    }

    // A fresh scheduling context starts running immediately.
    unsafe { sc.as_ref() }.remote_enqueue(true);

    Status::Success
}

pub fn sys_create_pt(view: SysCreatePt) -> Status {
    let target = match lookup_pd(view.pd(), OBJ_CTRL) {
        Ok(pd) => pd,
        Err(status) => return status,
    };

    let ec = match lookup_ec(view.ec(), OBJ_CTRL) {
        Ok(ec) => ec,
        Err(status) => return status,
    };

    let Some(pt) = Pt::create(target, NonNull::from(ec), view.eip(), view.mtd()) else {
        return Status::Ovrflow;
    };

    install_root(view.sel(), CapObj::Pt(pt))
}

pub fn sys_create_sm(view: SysCreateSm) -> Status {
    let target = match lookup_pd(view.pd(), OBJ_CTRL) {
        Ok(pd) => pd,
        Err(status) => return status,
    };

    let Some(sm) = Sm::create(target, view.cnt(), view.si_value()) else {
        return Status::Ovrflow;
    };

    install_root(view.sel(), CapObj::Sm(sm))
}
