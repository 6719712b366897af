/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: tests                                                           ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Boot-time self tests, run on the boot processor after the       ║
   ║         domains are up. Failures assert and halt the CPU.               ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Michael Schoettner, HHU                                         ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
mod delegate_tests;
mod mdb_tests;
mod sched_tests;
mod sm_tests;
mod syscall_tests;

use log::info;

pub fn run_tests() {
    info!("kernel: running self tests");

    mdb_tests::run();
    delegate_tests::run();
    sched_tests::run();
    sm_tests::run();
    syscall_tests::run();

    info!("kernel: all self tests passed.");
}
