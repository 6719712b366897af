/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: lapic                                                           ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Local APIC driver: inter-processor interrupts, the one-shot     ║
   ║         timer driving budget and wait deadlines, and the bounded        ║
   ║         pause-loop used while waiting for remote acknowledgments.       ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, HHU                                             ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::device::cpu;
use crate::interrupt::interrupt_dispatcher::{VEC_APIC_ERROR, VEC_SPURIOUS, VEC_TIMER};
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering::SeqCst;
use log::info;
use spin::{Mutex, Once};
use x2apic::lapic::{LocalApic, LocalApicBuilder, TimerDivide, TimerMode};

static LAPIC: Once<Mutex<LocalApic>> = Once::new();

/// TSC ticks per millisecond; calibrated during boot, with a conservative
/// default until then.
static TSC_KHZ: AtomicU64 = AtomicU64::new(1_000_000);

/// Map and enable the local APIC of the boot processor.
pub fn init(xapic_base: u64) {
    LAPIC.call_once(|| {
        let mut lapic = LocalApicBuilder::new()
            .timer_vector(VEC_TIMER as usize)
            .error_vector(VEC_APIC_ERROR as usize)
            .spurious_vector(VEC_SPURIOUS as usize)
            .set_xapic_base(xapic_base)
            .build()
            .unwrap_or_else(|err| panic!("Failed to initialize Local APIC ({})!", err));

        unsafe { lapic.enable() };
        info!("Local APIC enabled");

        Mutex::new(lapic)
    });
}

pub fn set_freq_khz(khz: u64) {
    TSC_KHZ.store(khz, SeqCst);
}

/// TSC frequency in kHz, i.e. ticks per millisecond.
pub fn freq_khz() -> u64 {
    TSC_KHZ.load(SeqCst)
}

/// Send an inter-processor interrupt to another CPU.
pub fn send_ipi(target: usize, vector: u8) {
    if let Some(lapic) = LAPIC.get() {
        unsafe { lapic.lock().send_ipi(vector, cpu::apic_id(target)) };
    }
}

pub fn eoi() {
    if let Some(lapic) = LAPIC.get() {
        unsafe { lapic.lock().end_of_interrupt() };
    }
}

/// Arm the one-shot timer `ticks` APIC timer ticks from now.
pub fn set_oneshot(ticks: u32) {
    if let Some(lapic) = LAPIC.get() {
        let mut lapic = lapic.lock();

        unsafe {
            lapic.set_timer_divide(TimerDivide::Div1);
            lapic.set_timer_mode(TimerMode::OneShot);
            lapic.set_timer_initial(ticks.max(1));
            lapic.enable_timer();
        }
    }
}

const PAUSE_BATCH: usize = 1000;

/// Spin while `cond` holds, for at most `units` pause-loop units.
/// Returns true iff the condition cleared in time.
pub fn pause_loop_until(units: u64, cond: impl Fn() -> bool) -> bool {
    for _ in 0..units {
        if !cond() {
            return true;
        }

        for _ in 0..PAUSE_BATCH {
            cpu::pause();
        }
    }

    !cond()
}
