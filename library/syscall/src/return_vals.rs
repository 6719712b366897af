/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: return_vals                                                     ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Consts and types for hypercall return values.                   ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Michael Schoettner, HHU                                         ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/

use num_enum::{FromPrimitive, IntoPrimitive};

/// Status codes returned by every hypercall.
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum Status {
    Success = 0,
    ComTim = 1,  // operation timed out
    BadCap = 2,  // capability missing or lacking permission
    BadPar = 3,  // invalid parameter
    BadMem = 4,  // invalid memory range
    BadFtr = 5,  // feature not available
    Aborted = 6, // operation aborted
    #[num_enum(default)]
    Ovrflow = 7, // quota exhausted
}

pub type SyscallResult = ::core::result::Result<(), Status>;

pub fn convert_syscall_result_to_ret_code(result: SyscallResult) -> usize {
    let status = match result {
        Ok(()) => Status::Success,
        Err(e) => e,
    };
    u8::from(status) as usize
}

pub fn convert_ret_code_to_syscall_result(ret_code: usize) -> SyscallResult {
    match Status::from(ret_code as u8) {
        Status::Success => Ok(()),
        e => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for code in 0u8..8 {
            let status = Status::from(code);
            assert_eq!(u8::from(status), code);
        }
    }

    #[test]
    fn result_conversion() {
        assert_eq!(convert_syscall_result_to_ret_code(Ok(())), 0);
        assert_eq!(convert_syscall_result_to_ret_code(Err(Status::BadCap)), 2);
        assert_eq!(convert_ret_code_to_syscall_result(0), Ok(()));
        assert_eq!(convert_ret_code_to_syscall_result(7), Err(Status::Ovrflow));
    }
}
