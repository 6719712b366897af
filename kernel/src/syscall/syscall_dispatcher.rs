/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: syscall_dispatcher                                              ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Hypercall decode. Each hypercall id has one argument view       ║
   ║         projecting the five argument registers into typed fields;       ║
   ║         handle() routes the decoded call to its handler. The            ║
   ║         register save/restore around this lives in the boot layer.      ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, HHU                                             ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::syscall::{sys_cap, sys_create, sys_ctrl, sys_ipc};
use syscall::{Crd, Hypercall, Qpd, Status};

/// The five argument words of a hypercall. ARG_1 carries the operation
/// flags in its low byte and a selector above.
pub struct SysArgs<'a>(pub &'a mut [usize; 5]);

impl<'a> SysArgs<'a> {
    pub fn flags(&self) -> usize {
        self.0[0] & 0xff
    }

    pub fn sel(&self) -> usize {
        self.0[0] >> 8
    }

    pub fn arg(&self, index: usize) -> usize {
        self.0[index]
    }

    pub fn set_arg(&mut self, index: usize, value: usize) {
        self.0[index] = value;
    }
}

pub struct SysCreatePd<'a>(pub SysArgs<'a>);

impl<'a> SysCreatePd<'a> {
    pub fn sel(&self) -> usize {
        self.0.sel()
    }

    /// Pages of budget moved from the creator into the new domain.
    pub fn limit(&self) -> usize {
        self.0.arg(1)
    }

    /// Initial delegation installed into the new domain.
    pub fn crd(&self) -> Crd {
        Crd::from_raw(self.0.arg(2))
    }
}

pub struct SysCreateEc<'a>(pub SysArgs<'a>);

impl<'a> SysCreateEc<'a> {
    pub fn sel(&self) -> usize {
        self.0.sel()
    }

    pub fn pd(&self) -> usize {
        self.0.arg(1)
    }

    pub fn cpu(&self) -> usize {
        self.0.arg(2) & 0xfff
    }

    pub fn utcb(&self) -> usize {
        self.0.arg(2) & !0xfff
    }

    pub fn esp(&self) -> usize {
        self.0.arg(3)
    }

    pub fn evt(&self) -> usize {
        self.0.arg(4)
    }
}

pub struct SysCreateSc<'a>(pub SysArgs<'a>);

impl<'a> SysCreateSc<'a> {
    pub fn sel(&self) -> usize {
        self.0.sel()
    }

    pub fn pd(&self) -> usize {
        self.0.arg(1)
    }

    pub fn ec(&self) -> usize {
        self.0.arg(2)
    }

    pub fn qpd(&self) -> Qpd {
        Qpd::from_raw(self.0.arg(3))
    }
}

pub struct SysCreatePt<'a>(pub SysArgs<'a>);

impl<'a> SysCreatePt<'a> {
    pub fn sel(&self) -> usize {
        self.0.sel()
    }

    pub fn pd(&self) -> usize {
        self.0.arg(1)
    }

    pub fn ec(&self) -> usize {
        self.0.arg(2)
    }

    pub fn mtd(&self) -> usize {
        self.0.arg(3)
    }

    pub fn eip(&self) -> usize {
        self.0.arg(4)
    }
}

pub struct SysCreateSm<'a>(pub SysArgs<'a>);

impl<'a> SysCreateSm<'a> {
    pub fn sel(&self) -> usize {
        self.0.sel()
    }

    pub fn pd(&self) -> usize {
        self.0.arg(1)
    }

    pub fn cnt(&self) -> usize {
        self.0.arg(2)
    }

    pub fn si_value(&self) -> usize {
        self.0.arg(3)
    }
}

pub struct SysRevoke<'a>(pub SysArgs<'a>);

impl<'a> SysRevoke<'a> {
    pub fn crd(&self) -> Crd {
        Crd::from_raw(self.0.arg(1))
    }

    pub fn this(&self) -> bool {
        self.0.flags() & syscall::flags::REVOKE_SELF != 0
    }

    pub fn remote(&self) -> bool {
        self.0.flags() & syscall::flags::REVOKE_REMOTE != 0
    }

    pub fn keep(&self) -> bool {
        self.0.flags() & syscall::flags::REVOKE_KEEP != 0
    }

    pub fn pd(&self) -> usize {
        self.0.arg(2)
    }
}

pub struct SysMisc<'a>(pub SysArgs<'a>);

impl<'a> SysMisc<'a> {
    pub fn op(&self) -> usize {
        self.0.flags() & 0x3
    }

    pub fn pd_snd(&self) -> usize {
        self.0.sel()
    }

    pub fn crd(&self) -> Crd {
        Crd::from_raw(self.0.arg(1))
    }

    pub fn set_crd(&mut self, crd: Crd) {
        self.0.set_arg(1, crd.raw());
    }

    pub fn pd_dst(&self) -> usize {
        self.0.arg(2)
    }

    /// Receive window for a delegation.
    pub fn window(&self) -> Crd {
        Crd::from_raw(self.0.arg(3))
    }

    pub fn hotspot(&self) -> usize {
        self.0.arg(4)
    }

    pub fn sleep_type_a(&self) -> usize {
        self.0.arg(1)
    }

    pub fn sleep_type_b(&self) -> usize {
        self.0.arg(2)
    }
}

pub struct SysCall<'a>(pub SysArgs<'a>);

impl<'a> SysCall<'a> {
    pub fn pt(&self) -> usize {
        self.0.sel()
    }

    pub fn disable_blocking(&self) -> bool {
        self.0.flags() & syscall::flags::CALL_DISABLE_BLOCKING != 0
    }
}

pub struct SysEcCtrl<'a>(pub SysArgs<'a>);

impl<'a> SysEcCtrl<'a> {
    pub fn ec(&self) -> usize {
        self.0.sel()
    }

    pub fn op(&self) -> usize {
        self.0.flags() & 0x7
    }

    pub fn set_time(&mut self, value: u64) {
        self.0.set_arg(1, (value >> 32) as usize);
        self.0.set_arg(2, value as u32 as usize);
    }
}

pub struct SysScCtrl<'a>(pub SysArgs<'a>);

impl<'a> SysScCtrl<'a> {
    pub fn sc(&self) -> usize {
        self.0.sel()
    }

    pub fn op(&self) -> usize {
        self.0.flags() & 0x3
    }

    pub fn set_time(&mut self, value: u64) {
        self.0.set_arg(1, (value >> 32) as usize);
        self.0.set_arg(2, value as u32 as usize);
    }
}

pub struct SysPtCtrl<'a>(pub SysArgs<'a>);

impl<'a> SysPtCtrl<'a> {
    pub fn pt(&self) -> usize {
        self.0.sel()
    }

    pub fn id(&self) -> usize {
        self.0.arg(1)
    }
}

pub struct SysSmCtrl<'a>(pub SysArgs<'a>);

impl<'a> SysSmCtrl<'a> {
    pub fn sm(&self) -> usize {
        self.0.sel()
    }

    pub fn down(&self) -> bool {
        self.0.flags() & syscall::flags::SM_CTRL_DN != 0
    }

    pub fn zero(&self) -> bool {
        self.0.flags() & syscall::flags::SM_CTRL_ZERO != 0
    }

    pub fn time(&self) -> u64 {
        self.0.arg(1) as u64
    }
}

pub struct SysPdCtrl<'a>(pub SysArgs<'a>);

impl<'a> SysPdCtrl<'a> {
    pub fn src(&self) -> usize {
        self.0.sel()
    }

    pub fn dbg(&self) -> bool {
        self.0.flags() & 0x2 != 0
    }

    pub fn dst(&self) -> usize {
        self.0.arg(1)
    }

    /// Pages of budget to transfer.
    pub fn tra(&self) -> usize {
        self.0.arg(2)
    }

    pub fn dump(&mut self, limit: usize, used: usize) {
        self.0.set_arg(1, limit);
        self.0.set_arg(2, used);
    }
}

pub struct SysAssignPci<'a>(pub SysArgs<'a>);

impl<'a> SysAssignPci<'a> {
    pub fn pd(&self) -> usize {
        self.0.sel()
    }

    /// Requester id of the device (bus/device/function).
    pub fn dev(&self) -> usize {
        self.0.arg(1)
    }
}

pub struct SysAssignGsi<'a>(pub SysArgs<'a>);

impl<'a> SysAssignGsi<'a> {
    pub fn sm(&self) -> usize {
        self.0.sel()
    }

    pub fn gsi(&self) -> usize {
        self.0.arg(1)
    }

    pub fn cpu(&self) -> usize {
        self.0.arg(2)
    }

    pub fn trg(&self) -> bool {
        self.0.flags() & 0b010 != 0
    }

    pub fn pol(&self) -> bool {
        self.0.flags() & 0b001 != 0
    }
}

/// Route a decoded hypercall. Blocking operations do not return through
/// here; their continuations finish the call.
pub fn handle(id: usize, args: &mut [usize; 5]) -> Status {
    let Ok(call) = Hypercall::try_from(id) else {
        return Status::BadPar;
    };

    match call {
        Hypercall::Call => sys_ipc::sys_call(SysCall(SysArgs(args))),
        Hypercall::Reply => sys_ipc::sys_reply(SysArgs(args)),
        Hypercall::CreatePd => sys_create::sys_create_pd(SysCreatePd(SysArgs(args))),
        Hypercall::CreateEc => sys_create::sys_create_ec(SysCreateEc(SysArgs(args))),
        Hypercall::CreateSc => sys_create::sys_create_sc(SysCreateSc(SysArgs(args))),
        Hypercall::CreatePt => sys_create::sys_create_pt(SysCreatePt(SysArgs(args))),
        Hypercall::CreateSm => sys_create::sys_create_sm(SysCreateSm(SysArgs(args))),
        Hypercall::Revoke => sys_cap::sys_revoke(SysRevoke(SysArgs(args))),
        Hypercall::Misc => sys_cap::sys_misc(SysMisc(SysArgs(args))),
        Hypercall::EcCtrl => sys_ctrl::sys_ec_ctrl(SysEcCtrl(SysArgs(args))),
        Hypercall::ScCtrl => sys_ctrl::sys_sc_ctrl(SysScCtrl(SysArgs(args))),
        Hypercall::PtCtrl => sys_ctrl::sys_pt_ctrl(SysPtCtrl(SysArgs(args))),
        Hypercall::SmCtrl => sys_ctrl::sys_sm_ctrl(SysSmCtrl(SysArgs(args))),
        Hypercall::PdCtrl => sys_ctrl::sys_pd_ctrl(SysPdCtrl(SysArgs(args))),
        Hypercall::AssignPci => sys_cap::sys_assign_pci(SysAssignPci(SysArgs(args))),
        Hypercall::AssignGsi => sys_cap::sys_assign_gsi(SysAssignGsi(SysArgs(args))),
    }
}
