/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: lib                                                             ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Hypercall interface shared between kernel and userland.         ║
   ║         Hypercall numbers, raw syscall stubs, capability range          ║
   ║         descriptors and status codes.                                   ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland & Michael Schoettner, HHU                        ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
#![no_std]

pub mod crd;
pub mod return_vals;

pub use crd::{Crd, CrdKind, Qpd};
pub use return_vals::Status;

#[cfg(feature = "userspace")]
use core::arch::asm;

use num_enum::TryFromPrimitive;

/// Hypercall numbers. The `Misc` call multiplexes lookup, delegate and
/// ACPI suspend through its first argument (see [`MiscOp`]).
#[repr(usize)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
pub enum Hypercall {
    Call = 0,
    Reply,
    CreatePd,
    CreateEc,
    CreateSc,
    CreatePt,
    CreateSm,
    Revoke,
    Misc,
    EcCtrl,
    ScCtrl,
    PtCtrl,
    SmCtrl,
    PdCtrl,
    AssignPci,
    AssignGsi,
}

pub const NUM_HYPERCALLS: usize = Hypercall::AssignGsi as usize + 1;

/// Sub-operations of [`Hypercall::Misc`].
#[repr(usize)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
pub enum MiscOp {
    Lookup = 0,
    Delegate = 1,
    AcpiSuspend = 2,
}

/// Flag bits in the low byte of ARG_1, next to the selector.
pub mod flags {
    pub const CALL_DISABLE_BLOCKING: usize = 1 << 0;
    pub const CALL_DISABLE_DONATION: usize = 1 << 1;
    pub const CALL_DISABLE_REPLYCAP: usize = 1 << 2;

    pub const REVOKE_SELF: usize = 1 << 0;
    pub const REVOKE_REMOTE: usize = 1 << 1;
    pub const REVOKE_KEEP: usize = 1 << 2;

    pub const SM_CTRL_DN: usize = 1 << 0;
    pub const SM_CTRL_ZERO: usize = 1 << 1;
}

#[cfg(feature = "userspace")]
#[inline(always)]
pub fn syscall0(call: Hypercall) -> usize {
    let ret: usize;

    unsafe {
        asm!(
        "syscall",
        inlateout("rax") call as usize => ret,
        out("rcx") _,
        out("r11") _,
        options(preserves_flags, nostack)
        );
    }

    return ret;
}

#[cfg(feature = "userspace")]
#[inline(always)]
pub fn syscall1(call: Hypercall, arg1: usize) -> usize {
    let ret: usize;

    unsafe {
        asm!(
        "syscall",
        inlateout("rax") call as usize => ret,
        in("rdi") arg1,
        out("rcx") _,
        out("r11") _,
        options(preserves_flags, nostack)
        );
    }

    return ret;
}

#[cfg(feature = "userspace")]
#[inline(always)]
pub fn syscall2(call: Hypercall, arg1: usize, arg2: usize) -> usize {
    let ret: usize;

    unsafe {
        asm!(
        "syscall",
        inlateout("rax") call as usize => ret,
        in("rdi") arg1,
        in("rsi") arg2,
        out("rcx") _,
        out("r11") _,
        options(preserves_flags, nostack)
        );
    }

    return ret;
}

#[cfg(feature = "userspace")]
#[inline(always)]
pub fn syscall3(call: Hypercall, arg1: usize, arg2: usize, arg3: usize) -> usize {
    let ret: usize;

    unsafe {
        asm!(
        "syscall",
        inlateout("rax") call as usize => ret,
        in("rdi") arg1,
        in("rsi") arg2,
        in("rdx") arg3,
        out("rcx") _,
        out("r11") _,
        options(preserves_flags, nostack)
        );
    }

    return ret;
}

#[cfg(feature = "userspace")]
#[inline(always)]
pub fn syscall4(call: Hypercall, arg1: usize, arg2: usize, arg3: usize, arg4: usize) -> usize {
    let ret: usize;

    unsafe {
        asm!(
        "syscall",
        inlateout("rax") call as usize => ret,
        in("rdi") arg1,
        in("rsi") arg2,
        in("rdx") arg3,
        in("r8") arg4,
        out("rcx") _,
        out("r11") _,
        options(preserves_flags, nostack)
        );
    }

    return ret;
}

#[cfg(feature = "userspace")]
#[inline(always)]
pub fn syscall5(call: Hypercall, arg1: usize, arg2: usize, arg3: usize, arg4: usize, arg5: usize) -> usize {
    let ret: usize;

    unsafe {
        asm!(
        "syscall",
        inlateout("rax") call as usize => ret,
        in("rdi") arg1,
        in("rsi") arg2,
        in("rdx") arg3,
        in("r8") arg4,
        in("r9") arg5,
        out("rcx") _,
        out("r11") _,
        options(preserves_flags, nostack)
        );
    }

    return ret;
}
