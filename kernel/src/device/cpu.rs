/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: cpu                                                             ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Per-CPU state: hazard bits, preemption windows, interrupt       ║
   ║         counters and CPU id lookup. All per-CPU data lives in fixed     ║
   ║         arrays indexed by the CPU id; the arrays are initialized        ║
   ║         during boot and never destroyed.                                ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Fabian Ruhland, HHU                                             ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::consts::MAX_CPUS;
use core::sync::atomic::Ordering::{Relaxed, SeqCst};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize};
use raw_cpuid::CpuId;
use x86_64::instructions::interrupts;

/// A runnable scheduling context with higher precedence exists; re-select
/// at the next scheduling boundary.
pub const HZD_SCHED: usize = 1 << 0;
/// A quota was exhausted mid-operation; unwind partial work.
pub const HZD_OOM: usize = 1 << 1;
/// An IOMMU-visible mapping changed; flush IOMMU page tables at the next
/// preempt-enabled point.
pub const HZD_IOMMU: usize = 1 << 2;

pub struct CpuLocal {
    online: AtomicBool,
    apic_id: AtomicU32,
    hazard: AtomicUsize,
    preemption: AtomicBool,
    irq_count: AtomicUsize,
}

impl CpuLocal {
    const fn new() -> Self {
        Self {
            online: AtomicBool::new(false),
            apic_id: AtomicU32::new(0),
            hazard: AtomicUsize::new(0),
            preemption: AtomicBool::new(false),
            irq_count: AtomicUsize::new(0),
        }
    }
}

static CPUS: [CpuLocal; MAX_CPUS] = [const { CpuLocal::new() }; MAX_CPUS];

/// Register a processor during boot.
pub fn set_online(cpu: usize, apic_id: u32) {
    CPUS[cpu].apic_id.store(apic_id, SeqCst);
    CPUS[cpu].online.store(true, SeqCst);
}

pub fn online(cpu: usize) -> bool {
    cpu < MAX_CPUS && CPUS[cpu].online.load(SeqCst)
}

pub fn apic_id(cpu: usize) -> u32 {
    CPUS[cpu].apic_id.load(Relaxed)
}

/// The id of the executing CPU, derived from its local APIC id.
pub fn id() -> usize {
    let apic_id = CpuId::new()
        .get_feature_info()
        .map(|info| info.initial_local_apic_id() as u32)
        .unwrap_or(0);

    for cpu in 0..MAX_CPUS {
        if CPUS[cpu].online.load(Relaxed) && CPUS[cpu].apic_id.load(Relaxed) == apic_id {
            return cpu;
        }
    }

    0
}

pub fn hazard() -> usize {
    CPUS[id()].hazard.load(SeqCst)
}

pub fn set_hazard(bits: usize) {
    CPUS[id()].hazard.fetch_or(bits, SeqCst);
}

pub fn clr_hazard(bits: usize) {
    CPUS[id()].hazard.fetch_and(!bits, SeqCst);
}

pub fn chk_hazard(bits: usize) -> bool {
    CPUS[id()].hazard.load(SeqCst) & bits != 0
}

/// Raise hazard bits on a remote CPU; consumed at its next scheduling
/// boundary.
pub fn set_hazard_of(cpu: usize, bits: usize) {
    CPUS[cpu].hazard.fetch_or(bits, SeqCst);
}

/// Interrupt counter of a CPU. Advances on every taken interrupt; the
/// shootdown path polls it to detect acknowledgment.
pub fn irq_count(cpu: usize) -> usize {
    CPUS[cpu].irq_count.load(SeqCst)
}

pub fn irq_count_inc() {
    CPUS[id()].irq_count.fetch_add(1, SeqCst);
}

/// True while the kernel may be interrupted on this CPU.
pub fn preemption() -> bool {
    CPUS[id()].preemption.load(Relaxed)
}

pub fn preempt_disable() {
    interrupts::disable();
    CPUS[id()].preemption.store(false, Relaxed);
}

pub fn preempt_enable() {
    CPUS[id()].preemption.store(true, Relaxed);
    interrupts::enable();
}

pub fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

pub fn pause() {
    core::hint::spin_loop();
}

/// A set of CPUs, updated atomically. Used for the per-domain `cpus`,
/// `htlb` and `gtlb` masks.
pub struct CpuSet(AtomicU64);

impl CpuSet {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Set a bit; returns true if it was newly set.
    pub fn set(&self, cpu: usize) -> bool {
        self.0.fetch_or(1 << cpu, SeqCst) & (1 << cpu) == 0
    }

    pub fn clr(&self, cpu: usize) {
        self.0.fetch_and(!(1 << cpu), SeqCst);
    }

    pub fn chk(&self, cpu: usize) -> bool {
        self.0.load(SeqCst) & (1 << cpu) != 0
    }

    pub fn merge(&self, other: &CpuSet) {
        self.0.fetch_or(other.0.load(SeqCst), SeqCst);
    }
}
