//! Memory fences, CAS helpers and the exponential-then-cooperative backoff
//! policy used throughout the ring, the allocators and the hash table.
//!
//! Every busy-wait loop in this crate goes through [`Backoff`] rather than
//! spinning unboundedly: after a bounded number of CPU-relax spins it falls
//! through to the thread's [`Relax`] hook, which lets a fiber scheduler
//! cooperatively yield instead of starving other fibers pinned to the same
//! core.
use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Spin ceiling before falling back to the relax hook (~0xfff iterations).
const SPIN_LIMIT: u32 = 0xfff;

/// A per-thread hook called by [`Backoff`] once the spin budget is
/// exhausted. Installed by the fiber scheduler to `fiber_yield` while a
/// fiber is running; defaults to a plain `std::thread::yield_now`.
pub trait Relax {
    fn relax(&self);
}

struct ThreadYield;

impl Relax for ThreadYield {
    fn relax(&self) {
        std::thread::yield_now();
    }
}

thread_local! {
    static RELAX_HOOK: RefCell<Box<dyn Relax>> = RefCell::new(Box::new(ThreadYield));
}

/// Installs `hook` as this thread's relax hook for the duration of the
/// returned guard; the previous hook (usually the default cooperative
/// yield) is restored on drop.
pub struct RelaxGuard {
    previous: Option<Box<dyn Relax>>,
}

impl Drop for RelaxGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            RELAX_HOOK.with(|h| *h.borrow_mut() = previous);
        }
    }
}

/// Installs a relax hook for the current thread, typically called once by
/// the fiber scheduler when it starts running fibers on this thread.
pub fn set_relax_hook(hook: Box<dyn Relax>) -> RelaxGuard {
    let previous = RELAX_HOOK.with(|h| std::mem::replace(&mut *h.borrow_mut(), hook));
    RelaxGuard {
        previous: Some(previous),
    }
}

fn relax_current_thread() {
    RELAX_HOOK.with(|h| h.borrow().relax());
}

/// Exponential-then-cooperative backoff: spins a bounded number of times
/// using a CPU relax instruction, then calls the thread's relax hook
/// (falling into a fiber yield, if a scheduler is running) forever after.
pub struct Backoff {
    spins: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    pub fn new() -> Self {
        Backoff { spins: 0 }
    }

    /// Performs one backoff step.
    pub fn spin(&mut self) {
        if self.spins < SPIN_LIMIT {
            for _ in 0..(1u32 << (self.spins.min(10))) {
                std::hint::spin_loop();
            }
            self.spins += 1;
        } else {
            relax_current_thread();
        }
    }

    /// True once the spin budget has been exhausted and every further call
    /// to `spin` will cooperate rather than busy-spin.
    pub fn is_completed(&self) -> bool {
        self.spins >= SPIN_LIMIT
    }
}

/// A monotonically increasing counter used to mint process-wide CAS stamps
/// (see [`crate::hashtable`]) and similar small identities.
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicUsize);

impl AtomicCounter {
    pub const fn new() -> Self {
        AtomicCounter(AtomicUsize::new(0))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) as u64 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_eventually_completes() {
        let mut b = Backoff::new();
        for _ in 0..(SPIN_LIMIT + 2) {
            b.spin();
        }
        assert!(b.is_completed());
    }

    #[test]
    fn counter_is_monotone_and_never_zero() {
        let c = AtomicCounter::new();
        let a = c.next();
        let b = c.next();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert!(b > a);
    }
}
