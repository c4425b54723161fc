//! Small synchronization primitives shared by the allocators, the event
//! dispatcher and the hash table.
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::backoff::Backoff;

/// A spinlock guarded by [`Backoff`], used for short critical sections where
/// blocking would be more expensive than spinning: the global arena and the
/// event dispatcher's pending-changes batch.
pub struct Spinlock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub const fn new(value: T) -> Self {
        Spinlock {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        let mut backoff = Backoff::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.spin();
        }
        SpinlockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinlockGuard { lock: self })
    }
}

pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<'a, T> Deref for SpinlockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T> DerefMut for SpinlockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T> Drop for SpinlockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// A sense-reversing barrier: threads rendezvous without any blocking OS
/// primitive by flipping a shared sense bit on the last arrival and
/// comparing it against a private per-thread sense.
pub struct SenseBarrier {
    count: std::sync::atomic::AtomicUsize,
    total: usize,
    sense: AtomicBool,
}

impl SenseBarrier {
    pub fn new(total: usize) -> Self {
        SenseBarrier {
            count: std::sync::atomic::AtomicUsize::new(0),
            total,
            sense: AtomicBool::new(false),
        }
    }

    /// Waits for every one of `total` participants to call `wait`.
    ///
    /// `local_sense` is a per-thread flag that must be initialized to
    /// `false` and is flipped by this call; it must be reused across
    /// repeated waits on the same barrier by the same thread.
    pub fn wait(&self, local_sense: &mut bool) {
        let my_sense = !*local_sense;
        *local_sense = my_sense;
        let arrived = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if arrived == self.total {
            self.count.store(0, Ordering::Relaxed);
            self.sense.store(my_sense, Ordering::Release);
        } else {
            let mut backoff = Backoff::new();
            while self.sense.load(Ordering::Acquire) != my_sense {
                backoff.spin();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn spinlock_excludes_concurrent_writers() {
        let lock = Arc::new(Spinlock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 80_000);
    }

    #[test]
    fn barrier_releases_all_participants() {
        let barrier = Arc::new(SenseBarrier::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                let mut sense = false;
                barrier.wait(&mut sense);
                42
            }));
        }
        for h in handles {
            assert_eq!(h.join().unwrap(), 42);
        }
    }
}
