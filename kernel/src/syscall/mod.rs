/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: syscall                                                         ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Hypercall handling. The dispatcher decodes the argument         ║
   ║         registers into typed views and translates them into             ║
   ║         operations on the kernel objects; no business logic lives       ║
   ║         here.                                                           ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland & Michael Schoettner, HHU                        ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
pub mod sys_cap;
pub mod sys_create;
pub mod sys_ctrl;
pub mod sys_ipc;
pub mod syscall_dispatcher;

use crate::process::ec;
use crate::process::ec::Ec;
use crate::process::pd::Pd;
use crate::process::pt::Pt;
use crate::process::sc::Sc;
use crate::process::sm::Sm;
use crate::space::space_obj::{CapObj, Capability};
use syscall::Status;

/// Finish the current system call with `status` and hand the CPU back.
/// Used directly and as the continuation wakeup paths install.
pub fn sys_finish(status: Status) -> ! {
    let Some(ec) = ec::current() else {
        Sc::schedule(false, true);
    };

    ec.clr_timeout();
    ec.set_status(status);
    ec.activate();
}

pub fn sys_finish_success() -> ! {
    sys_finish(Status::Success)
}

pub fn sys_finish_com_tim() -> ! {
    sys_finish(Status::ComTim)
}

pub fn sys_finish_bad_cap() -> ! {
    sys_finish(Status::BadCap)
}

/// Resolve a selector in the current domain's object space, requiring
/// `need` attribute bits.
fn lookup_cap(sel: usize, need: usize) -> Result<Capability, Status> {
    let cap = crate::process::pd::current().obj.lookup(sel).ok_or(Status::BadCap)?;

    if cap.attr & need != need {
        return Err(Status::BadCap);
    }

    Ok(cap)
}

fn lookup_pd(sel: usize, need: usize) -> Result<&'static Pd, Status> {
    match lookup_cap(sel, need)?.obj {
        CapObj::Pd(pd) => Ok(unsafe { &*pd.as_ptr() }),
        _ => Err(Status::BadCap),
    }
}

fn lookup_ec(sel: usize, need: usize) -> Result<&'static Ec, Status> {
    match lookup_cap(sel, need)?.obj {
        CapObj::Ec(ec) => Ok(unsafe { &*ec.as_ptr() }),
        _ => Err(Status::BadCap),
    }
}

fn lookup_sc(sel: usize, need: usize) -> Result<&'static Sc, Status> {
    match lookup_cap(sel, need)?.obj {
        CapObj::Sc(sc) => Ok(unsafe { &*sc.as_ptr() }),
        _ => Err(Status::BadCap),
    }
}

fn lookup_pt(sel: usize, need: usize) -> Result<&'static Pt, Status> {
    match lookup_cap(sel, need)?.obj {
        CapObj::Pt(pt) => Ok(unsafe { &*pt.as_ptr() }),
        _ => Err(Status::BadCap),
    }
}

fn lookup_sm(sel: usize, need: usize) -> Result<&'static Sm, Status> {
    match lookup_cap(sel, need)?.obj {
        CapObj::Sm(sm) => Ok(unsafe { &*sm.as_ptr() }),
        _ => Err(Status::BadCap),
    }
}
