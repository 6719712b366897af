/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: sys_ctrl                                                        ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Control hypercalls on existing objects: recall and time         ║
   ║         queries, portal ids, semaphore up/down and quota transfer       ║
   ║         between domains.                                                ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Michael Schoettner, HHU                                         ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::device::cpu;
use crate::device::cpu::HZD_SCHED;
use crate::device::lapic;
use crate::interrupt::interrupt_dispatcher::VEC_IPI_RKE;
use crate::process::ec;
use crate::syscall::syscall_dispatcher::{SysEcCtrl, SysPdCtrl, SysPtCtrl, SysScCtrl, SysSmCtrl};
use crate::syscall::{lookup_ec, lookup_pd, lookup_pt, lookup_sc, lookup_sm};
use syscall::crd::OBJ_CTRL;
use syscall::Status;

pub fn sys_ec_ctrl(mut view: SysEcCtrl) -> Status {
    let target = match lookup_ec(view.ec(), OBJ_CTRL) {
        Ok(ec) => ec,
        Err(status) => return status,
    };

    match view.op() {
        // Recall: force the target's CPU through the scheduler.
        0 => {
            if target.cpu == cpu::id() {
                cpu::set_hazard(HZD_SCHED);
            } else {
                lapic::send_ipi(target.cpu, VEC_IPI_RKE);
            }
            Status::Success
        }

        // Query the time the EC spent off-CPU.
        1 => {
            view.set_time(target.tsc_offset() as u64);
            Status::Success
        }

        _ => Status::BadPar,
    }
}

pub fn sys_sc_ctrl(mut view: SysScCtrl) -> Status {
    let target = match lookup_sc(view.sc(), OBJ_CTRL) {
        Ok(sc) => sc,
        Err(status) => return status,
    };

    match view.op() {
        // Query consumed CPU time.
        0 => {
            view.set_time(target.time());
            Status::Success
        }

        _ => Status::BadPar,
    }
}

pub fn sys_pt_ctrl(view: SysPtCtrl) -> Status {
    let target = match lookup_pt(view.pt(), OBJ_CTRL) {
        Ok(pt) => pt,
        Err(status) => return status,
    };

    target.set_id(view.id());
    Status::Success
}

pub fn sys_sm_ctrl(view: SysSmCtrl) -> Status {
    let target = match lookup_sm(view.sm(), OBJ_CTRL) {
        Ok(sm) => sm,
        Err(status) => return status,
    };

    if view.down() {
        let Some(caller) = ec::current() else {
            return Status::BadPar;
        };

        // Blocks unless the counter is positive; wakeups finish the call
        // through their continuation.
        target.dn(view.zero(), view.time(), caller, true);
        Status::Success
    } else {
        target.up(None, None);
        Status::Success
    }
}

pub fn sys_pd_ctrl(mut view: SysPdCtrl) -> Status {
    let src = match lookup_pd(view.src(), OBJ_CTRL) {
        Ok(pd) => pd,
        Err(status) => return status,
    };

    if view.dbg() {
        view.dump(src.quota.limit(), src.quota.used());
        return Status::Success;
    }

    let dst = match lookup_pd(view.dst(), OBJ_CTRL) {
        Ok(pd) => pd,
        Err(status) => return status,
    };

    if !src.quota.transfer_to(&dst.quota, view.tra()) {
        return Status::Ovrflow;
    }

    Status::Success
}
