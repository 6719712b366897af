/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: irqsave_spinlock                                                ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ An irq save and multicore save spinlock for a generic data type.        ║
   ║ Used for data that interrupt handlers touch, e.g. the ready queues.     ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Michael Schoettner, Univ. Duesseldorf                           ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use crate::device::cpu;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};
use x86_64::instructions::interrupts;

/// An IRQ-save spinlock protecting a value of type `T`.
pub struct IrqSaveSpinlock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// Safety: the lock enforces exclusive access, so Send/Sync depend on T
// like for the standard locks.
unsafe impl<T: Send> Send for IrqSaveSpinlock<T> {}
unsafe impl<T: Send> Sync for IrqSaveSpinlock<T> {}

pub struct IrqSaveGuard<'a, T> {
    lock: &'a IrqSaveSpinlock<T>,
    irq_prev: bool,
}

impl<T> IrqSaveSpinlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, disabling local IRQs until the guard is dropped.
    #[inline]
    pub fn lock(&self) -> IrqSaveGuard<'_, T> {
        let irq_prev = interrupts::are_enabled();
        interrupts::disable();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            cpu::pause();
        }

        IrqSaveGuard { lock: self, irq_prev }
    }

    /// Try to acquire the lock without spinning.
    #[inline]
    pub fn try_lock(&self) -> Option<IrqSaveGuard<'_, T>> {
        let irq_prev = interrupts::are_enabled();
        interrupts::disable();

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqSaveGuard { lock: self, irq_prev })
        } else {
            if irq_prev {
                interrupts::enable();
            }
            None
        }
    }
}

impl<'a, T> Drop for IrqSaveGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        // Release the lock first to publish writes, then restore the
        // interrupt state.
        self.lock.locked.store(false, Ordering::Release);
        if self.irq_prev {
            interrupts::enable();
        }
    }
}

impl<'a, T> Deref for IrqSaveGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T> DerefMut for IrqSaveGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}
