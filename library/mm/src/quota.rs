/* ╔═════════════════════════════════════════════════════════════════════════╗
   ║ Module: quota                                                           ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Descr.: Transferable page budgets. Every physical allocation is         ║
   ║         charged against the owning protection domain's quota; budget    ║
   ║         moves between domains only through transfer_to.                 ║
   ╟─────────────────────────────────────────────────────────────────────────╢
   ║ Author: Michael Schoettner, HHU                                         ║
   ╚═════════════════════════════════════════════════════════════════════════╝
*/
use core::ptr;
use spin::Mutex;

struct QuotaState {
    limit: usize,
    used: usize,
}

/// A page budget. `limit` is the number of pages this quota may hold,
/// `used` the number currently allocated against it.
pub struct Quota {
    state: Mutex<QuotaState>,
}

impl Quota {
    pub const fn new(limit: usize) -> Self {
        Self { state: Mutex::new(QuotaState { limit, used: 0 }) }
    }

    pub const fn empty() -> Self {
        Self::new(0)
    }

    pub fn limit(&self) -> usize {
        self.state.lock().limit
    }

    pub fn used(&self) -> usize {
        self.state.lock().used
    }

    /// Would charging `count` more pages exceed the limit?
    pub fn hit_limit(&self, count: usize) -> bool {
        let state = self.state.lock();
        state.used + count > state.limit
    }

    /// Charge `count` pages. Returns false without charging if the limit
    /// would be exceeded.
    pub fn charge(&self, count: usize) -> bool {
        let mut state = self.state.lock();
        if state.used + count > state.limit {
            return false;
        }

        state.used += count;
        true
    }

    /// Return `count` previously charged pages.
    pub fn credit(&self, count: usize) {
        let mut state = self.state.lock();
        assert!(state.used >= count, "quota credit underflow");
        state.used -= count;
    }

    /// Move `count` pages of unused budget from this quota to `dst`.
    /// Atomic with respect to concurrent allocations against either side.
    pub fn transfer_to(&self, dst: &Quota, count: usize) -> bool {
        if ptr::eq(self, dst) {
            return true;
        }

        // Both locks are needed; acquire in address order so that two
        // concurrent opposite transfers cannot deadlock.
        let (mut first, mut second, src_is_first) = if (ptr::from_ref(self) as usize) < (ptr::from_ref(dst) as usize) {
            (self.state.lock(), dst.state.lock(), true)
        } else {
            (dst.state.lock(), self.state.lock(), false)
        };

        let (src, dst) = if src_is_first {
            (&mut *first, &mut *second)
        } else {
            (&mut *second, &mut *first)
        };

        if src.limit - src.used < count {
            return false;
        }

        src.limit -= count;
        dst.limit += count;
        true
    }

    /// Hand all unused budget back to `to`. Used when a protection domain
    /// is destroyed.
    pub fn free_up(&self, to: &Quota) {
        let remaining = {
            let mut state = self.state.lock();
            let remaining = state.limit - state.used;
            state.limit -= remaining;
            remaining
        };

        to.state.lock().limit += remaining;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_and_credit() {
        let quota = Quota::new(4);
        assert!(!quota.hit_limit(4));
        assert!(quota.hit_limit(5));

        assert!(quota.charge(3));
        assert_eq!(quota.used(), 3);
        assert!(!quota.charge(2));
        assert_eq!(quota.used(), 3);

        quota.credit(2);
        assert_eq!(quota.used(), 1);
        assert!(quota.charge(2));
    }

    #[test]
    fn transfer_moves_unused_budget() {
        let src = Quota::new(10);
        let dst = Quota::empty();

        assert!(src.charge(4));
        assert!(src.transfer_to(&dst, 6));
        assert_eq!(src.limit(), 4);
        assert_eq!(dst.limit(), 6);

        // Only unused budget can move.
        assert!(!src.transfer_to(&dst, 1));
    }

    #[test]
    fn free_up_returns_remaining_budget() {
        let parent = Quota::new(2);
        let child = Quota::new(8);

        assert!(child.charge(3));
        child.free_up(&parent);
        assert_eq!(parent.limit(), 7);
        assert_eq!(child.limit(), 3);
    }
}
