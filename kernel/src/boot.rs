/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: boot                                                            ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Kernel bring-up on the boot processor. The low-level entry      ║
   ║         (stack, paging, GDT/IDT stubs) lives in the platform layer      ║
   ║         and jumps here with a valid stack.                              ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland & Michael Schoettner, HHU                        ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::consts::KERNEL_HEAP_SIZE;
use crate::device::cpu;
use crate::memory::pool;
use crate::process::ec::Ec;
use crate::process::pd;
use crate::process::sc;
use crate::process::sc::Sc;
use crate::{allocator, logger, tests};
use core::cell::UnsafeCell;
use log::info;
use raw_cpuid::CpuId;
use syscall::crd::ATTR_FULL;

#[repr(C, align(4096))]
struct HeapArena(UnsafeCell<[u8; KERNEL_HEAP_SIZE]>);

unsafe impl Sync for HeapArena {}

static HEAP: HeapArena = HeapArena(UnsafeCell::new([0; KERNEL_HEAP_SIZE]));

/// Entry from the platform layer on the boot processor.
#[unsafe(no_mangle)]
pub extern "C" fn start() -> ! {
    logger().init();
    info!("Welcome to the microhypervisor kernel!");

    unsafe { allocator().init(HEAP.0.get() as *mut u8, KERNEL_HEAP_SIZE) };
    logger().enable_queue();
    info!("Kernel heap initialized");

    pool::init();
    info!("Physical pool initialized ([{}] pages)", pool::pages());

    let apic_id = CpuId::new()
        .get_feature_info()
        .map(|info| info.initial_local_apic_id() as u32)
        .unwrap_or(0);
    cpu::set_online(0, apic_id);

    pd::init(0);
    info!("Kernel and root domains initialized");

    // Hand the root domain its initial resources by delegation; this is
    // the same path any later transfer takes.
    let root = pd::root();
    let kern = pd::kern();
    root.delegate::<crate::space::space_mem::SpaceMem>(kern, 0, 0, 63, ATTR_FULL, 0);
    root.delegate::<crate::space::space_pio::SpacePio>(kern, 0, 0, 16, ATTR_FULL, 0);

    // The idle context keeps the ready queue non-empty and is the CPU's
    // quiescent point.
    let idle_ec = Ec::create(root, 0, 0, 0).expect("failed to create the idle EC");
    let idle_sc = Sc::create(root, idle_ec, 0, 0, 1000).expect("failed to create the idle SC");
    sc::set_current_boot(idle_sc);

    tests::run_tests();

    info!("Boot complete, idling");
    unsafe { idle_sc.as_ref() }.ready_enqueue(cpu::rdtsc(), true, false);
    Sc::schedule(true, false);
}

/// Entry for application processors.
#[unsafe(no_mangle)]
pub extern "C" fn start_ap(cpu_id: usize, apic_id: u32) -> ! {
    cpu::set_online(cpu_id, apic_id);
    pd::root().mem.init(pd::root(), cpu_id);

    let idle_ec = Ec::create(pd::root(), cpu_id, 0, 0).expect("failed to create an AP idle EC");
    let idle_sc = Sc::create(pd::root(), idle_ec, cpu_id, 0, 1000).expect("failed to create an AP idle SC");
    sc::set_current_boot(idle_sc);

    info!("CPU [{}] online", cpu_id);

    unsafe { idle_sc.as_ref() }.ready_enqueue(cpu::rdtsc(), true, false);
    Sc::schedule(true, false);
}
