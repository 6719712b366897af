/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: ioapic                                                          ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: IOAPIC redirection table programming, plus suspend/resume.      ║
   ║         Suspend saves the redirection entries of each IOAPIC into one   ║
   ║         page allocated from the caller's quota; resume restores and     ║
   ║         frees it.                                                       ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, HHU                                             ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::device::cpu;
use crate::memory::pages;
use core::mem::size_of;
use core::ptr::NonNull;
use log::{error, info};
use mm::{Quota, PAGE_SIZE};
use spin::Mutex;
use x2apic::ioapic::{IoApic, IrqFlags, IrqMode, RedirectionTableEntry};

struct Entry {
    io: IoApic,
    gsi_base: u32,
    saved: Option<NonNull<RedirectionTableEntry>>,
}

unsafe impl Send for Entry {}

static IOAPICS: Mutex<alloc::vec::Vec<Entry>> = Mutex::new(alloc::vec::Vec::new());

/// Register one IOAPIC by its MMIO address and first global system
/// interrupt.
pub unsafe fn init(mmio: u64, gsi_base: u32) {
    let io = unsafe {
        let mut io = IoApic::new(mmio);
        io.init(gsi_base as u8);
        io
    };

    info!("IOAPIC at [{:#x}] handles GSIs starting at [{}]", mmio, gsi_base);
    IOAPICS.lock().push(Entry { io, gsi_base, saved: None });
}

/// The last valid redirection table index of the IOAPIC owning `gsi`.
pub fn irt_max(gsi: u32) -> Option<u8> {
    let mut ioapics = IOAPICS.lock();
    let entry = ioapics.iter_mut().find(|entry| entry.gsi_base <= gsi)?;
    Some(unsafe { entry.io.max_table_entry() })
}

/// Program the redirection entry of `gsi`: vector, target CPU, trigger
/// and polarity. Masked entries stay off until unmasked by a rewrite.
pub fn set_irt(gsi: u32, vector: u8, target: usize, level: bool, active_low: bool, masked: bool) {
    let mut ioapics = IOAPICS.lock();
    let Some(ioapic) = ioapics.iter_mut().find(|entry| entry.gsi_base <= gsi) else {
        return;
    };

    let mut entry = RedirectionTableEntry::default();
    let mut flags = IrqFlags::empty();

    if masked {
        flags |= IrqFlags::MASKED;
    }
    if level {
        flags |= IrqFlags::LEVEL_TRIGGERED;
    }
    if active_low {
        flags |= IrqFlags::LOW_ACTIVE;
    }

    entry.set_mode(IrqMode::Fixed);
    entry.set_vector(vector);
    entry.set_dest(cpu::apic_id(target) as u8);
    entry.set_flags(flags);

    unsafe { ioapic.io.set_table_entry((gsi - ioapic.gsi_base) as u8, entry) };
}

/// Move a programmed entry to another CPU; the shadow configuration is
/// kept by the interrupt dispatcher, which rewrites the full entry.
pub fn set_cpu(gsi: u32, vector: u8, target: usize, level: bool, active_low: bool) {
    set_irt(gsi, vector, target, level, active_low, false);
}

/// Save all redirection entries into quota-charged pages.
pub fn suspend(quota: &Quota) -> bool {
    let mut ioapics = IOAPICS.lock();
    let mut ok = true;

    for entry in ioapics.iter_mut() {
        if entry.saved.is_some() {
            continue;
        }

        let max = unsafe { entry.io.max_table_entry() } as usize;
        if (max + 1) * size_of::<RedirectionTableEntry>() > PAGE_SIZE {
            error!("IOAPIC redirection table exceeds one page, not saved");
            ok = false;
            continue;
        }

        let Some(page) = pages::alloc_page(quota) else {
            ok = false;
            continue;
        };
        let table = page.cast::<RedirectionTableEntry>();

        for irq in 0..=max {
            let value = unsafe { entry.io.table_entry(irq as u8) };
            unsafe { table.as_ptr().add(irq).write(value) };
        }

        entry.saved = Some(table);
    }

    ok
}

/// Restore saved redirection entries and give the pages back.
pub fn resume(quota: &Quota) {
    let mut ioapics = IOAPICS.lock();

    for entry in ioapics.iter_mut() {
        let Some(table) = entry.saved.take() else {
            continue;
        };

        let max = unsafe { entry.io.max_table_entry() } as usize;
        for irq in 0..=max {
            let value = unsafe { table.as_ptr().add(irq).read() };
            unsafe { entry.io.set_table_entry(irq as u8, value) };
        }

        unsafe { pages::free_page(quota, table.cast()) };
    }
}
