/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: interrupt_dispatcher                                            ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Interrupt vector assignment and dispatch. The low-level stubs   ║
   ║         in the boot layer funnel every taken vector into dispatch();    ║
   ║         device interrupts (GSIs) signal the semaphore bound to them.    ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, HHU                                             ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::device::cpu;
use crate::device::ioapic;
use crate::device::lapic;
use crate::process::sc;
use crate::process::sm::SmPtr;
use crate::timer;
use log::warn;
use spin::Mutex;

/// Device interrupts start here; one vector per global system interrupt.
pub const VEC_GSI_BASE: u8 = 0x30;
pub const NUM_GSIS: usize = 48;

/// Remote ready-queue IPI: another CPU enqueued a scheduling context.
pub const VEC_IPI_RRQ: u8 = 0xf5;
/// Kick IPI: reschedule or TLB shootdown acknowledgment.
pub const VEC_IPI_RKE: u8 = 0xf6;
/// LAPIC one-shot timer (budgets and wait timeouts).
pub const VEC_TIMER: u8 = 0xf9;
pub const VEC_APIC_ERROR: u8 = 0xfe;
pub const VEC_SPURIOUS: u8 = 0xff;

struct GsiBinding {
    sm: Option<SmPtr>,
    level: bool,
    active_low: bool,
}

static GSI_TABLE: Mutex<[GsiBinding; NUM_GSIS]> = Mutex::new(
    [const {
        GsiBinding {
            sm: None,
            level: false,
            active_low: false,
        }
    }; NUM_GSIS],
);

/// Bind a global system interrupt to a semaphore and program its
/// redirection entry towards `target`.
pub fn assign_gsi(gsi: usize, sm: SmPtr, target: usize, level: bool, active_low: bool) -> bool {
    if gsi >= NUM_GSIS {
        return false;
    }

    {
        let mut table = GSI_TABLE.lock();
        table[gsi] = GsiBinding { sm: Some(sm), level, active_low };
    }

    ioapic::set_irt(gsi as u32, VEC_GSI_BASE + gsi as u8, target, level, active_low, false);
    true
}

/// Move an already bound GSI to another CPU.
pub fn route_gsi(gsi: usize, target: usize) -> bool {
    if gsi >= NUM_GSIS {
        return false;
    }

    let (bound, level, active_low) = {
        let table = GSI_TABLE.lock();
        (table[gsi].sm.is_some(), table[gsi].level, table[gsi].active_low)
    };

    if !bound {
        return false;
    }

    ioapic::set_cpu(gsi as u32, VEC_GSI_BASE + gsi as u8, target, level, active_low);
    true
}

/// Entry point for every taken interrupt vector.
pub fn dispatch(vector: u8) {
    cpu::irq_count_inc();

    match vector {
        VEC_SPURIOUS => return,
        VEC_IPI_RRQ => sc::rrq_handler(),
        VEC_IPI_RKE => sc::rke_handler(),
        VEC_TIMER => timer::tick(),
        VEC_APIC_ERROR => warn!("APIC error interrupt"),
        v if (VEC_GSI_BASE..VEC_GSI_BASE + NUM_GSIS as u8).contains(&v) => {
            let gsi = (v - VEC_GSI_BASE) as usize;
            let sm = GSI_TABLE.lock()[gsi].sm;

            match sm {
                // The semaphore doubles as the signal info, carrying its
                // value to the waiter.
                Some(sm) => unsafe {
                    let sm = sm.0.as_ref();
                    sm.up(None, Some(sm));
                },
                None => warn!("unbound device interrupt on GSI [{}]", gsi),
            }
        }
        v => warn!("spurious interrupt vector [{:#x}]", v),
    }

    lapic::eoi();
}
