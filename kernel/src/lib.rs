/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: lib                                                             ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Kernel of a capability-based microhypervisor. Protection        ║
   ║         domains own address spaces and capabilities, execution          ║
   ║         contexts carry register state, scheduling contexts drive CPU    ║
   ║         time, and portals/semaphores mediate IPC.                       ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland & Michael Schoettner, HHU                        ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
#![no_std]

extern crate alloc;

use crate::log::Logger;
use crate::memory::alloc::KernelAllocator;
use ::log::error;
use core::panic::PanicInfo;

pub mod boot;
pub mod cap;
pub mod consts;
pub mod device;
pub mod interrupt;
pub mod log;
pub mod memory;
pub mod process;
pub mod rcu;
pub mod space;
pub mod sync;
pub mod syscall;
pub mod tests;
pub mod timer;

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator::new();

static LOGGER: Logger = Logger::new();

pub fn allocator() -> &'static KernelAllocator {
    &ALLOCATOR
}

pub fn logger() -> &'static Logger {
    &LOGGER
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    error!("Panic: {}", info);

    loop {
        x86_64::instructions::hlt();
    }
}
