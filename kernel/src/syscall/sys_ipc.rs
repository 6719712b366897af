/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: sys_ipc                                                         ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Portal call and reply. A call donates the caller's CPU to the   ║
   ║         portal's handler EC and parks the caller until the reply        ║
   ║         comes back; the handler receives the portal id and the          ║
   ║         caller's argument registers.                                    ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Michael Schoettner, HHU                                         ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::process::ec;
use crate::rcu;
use crate::syscall::sys_finish;
use crate::syscall::syscall_dispatcher::{SysArgs, SysCall};
use crate::syscall::lookup_pt;
use core::ptr::NonNull;
use syscall::crd::OBJ_CALL;
use syscall::Status;

pub fn sys_call(view: SysCall) -> Status {
    let pt = match lookup_pt(view.pt(), OBJ_CALL) {
        Ok(pt) => pt,
        Err(status) => return status,
    };

    let Some(caller) = ec::current() else {
        return Status::BadPar;
    };

    // Portal handlers are bound to the caller's CPU; the control transfer
    // never crosses cores.
    let handler = pt.ec_ref();
    if handler.cpu != caller.cpu {
        return Status::BadPar;
    }

    if handler.partner().is_some() {
        // Handler is serving someone else.
        if view.disable_blocking() {
            return Status::ComTim;
        }
        return Status::Aborted;
    }

    // The partner link keeps the caller alive while it is parked; the
    // caller's capability can be revoked from another CPU meanwhile.
    if !caller.kobj.add_ref() {
        return Status::BadCap;
    }

    handler.set_partner(Some(NonNull::from(caller)));

    // Hand the caller's message registers and the portal id over.
    caller.with_regs(|regs| {
        let args = regs.args;
        handler.with_regs(|hregs| {
            hregs.args = args;
            hregs.si_value = pt.id();
        });
    });

    // The caller's scheduling context keeps running (donation); the
    // partner link parks the caller until the reply.
    handler.activate();
}

pub fn sys_reply(_view: SysArgs) -> Status {
    let Some(replier) = ec::current() else {
        return Status::BadPar;
    };

    let Some(caller) = replier.partner() else {
        // Nothing to reply to.
        sys_finish(Status::BadCap);
    };

    replier.set_partner(None);

    let caller = unsafe { caller.as_ref() };

    // Return the handler's message registers as the reply.
    replier.with_regs(|regs| {
        let args = regs.args;
        caller.with_regs(|cregs| {
            cregs.args = args;
            cregs.status = Status::Success;
        });
    });

    // Drop the reference the partner link held. A caller that died while
    // parked goes to RCU instead of back to user mode.
    if caller.kobj.del_rcu() {
        rcu::call(&caller.kobj.rcu);
        sys_finish(Status::BadCap);
    }

    caller.activate();
}
