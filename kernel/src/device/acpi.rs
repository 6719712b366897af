/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: acpi                                                            ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Sleep-state plumbing. Table discovery happens in the boot       ║
   ║         layer, which hands the PM register ports in; suspend saves      ║
   ║         the IOAPIC state and writes the sleep type registers.           ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Michael Schoettner, HHU                                         ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::device::cpu;
use crate::device::ioapic;
use crate::device::lapic;
use crate::process::pd;
use core::sync::atomic::AtomicU16;
use core::sync::atomic::Ordering::SeqCst;
use log::info;
use syscall::Status;
use x86_64::instructions::port::Port;

static PM1A_CNT: AtomicU16 = AtomicU16::new(0);
static PM1B_CNT: AtomicU16 = AtomicU16::new(0);
static RESET_PORT: AtomicU16 = AtomicU16::new(0);
static RESET_VALUE: AtomicU16 = AtomicU16::new(0);

const SLP_EN: u16 = 1 << 13;

pub struct Acpi;

impl Acpi {
    /// Record the register locations found during table discovery.
    pub fn setup(pm1a_cnt: u16, pm1b_cnt: u16) {
        PM1A_CNT.store(pm1a_cnt, SeqCst);
        PM1B_CNT.store(pm1b_cnt, SeqCst);
    }

    pub fn init(reset_port: u16, reset_value: u16) {
        RESET_PORT.store(reset_port, SeqCst);
        RESET_VALUE.store(reset_value, SeqCst);
    }

    /// Busy-wait for `ms` milliseconds on the TSC.
    pub fn delay(ms: u64) {
        let deadline = cpu::rdtsc() + ms * lapic::freq_khz();
        while cpu::rdtsc() < deadline {
            cpu::pause();
        }
    }

    pub fn reset() {
        let port = RESET_PORT.load(SeqCst);
        if port != 0 {
            unsafe { Port::<u8>::new(port).write(RESET_VALUE.load(SeqCst) as u8) };
        }
    }

    /// Enter the sleep state described by the two type values. IOAPIC
    /// state is parked in pages charged to the root domain's quota and
    /// restored on the resume path.
    pub fn suspend(type_a: u16, type_b: u16) -> Status {
        let pm1a = PM1A_CNT.load(SeqCst);
        if pm1a == 0 {
            return Status::BadFtr;
        }

        let quota = &pd::root().quota;
        if !ioapic::suspend(quota) {
            return Status::Ovrflow;
        }

        info!("Suspending (type a [{:#x}], type b [{:#x}])", type_a, type_b);

        unsafe {
            Port::<u16>::new(pm1a).write((type_a << 10) | SLP_EN);

            let pm1b = PM1B_CNT.load(SeqCst);
            if pm1b != 0 {
                Port::<u16>::new(pm1b).write((type_b << 10) | SLP_EN);
            }
        }

        // Execution continues here after wakeup.
        ioapic::resume(quota);
        Status::Success
    }
}
