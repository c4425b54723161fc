//! An OS thread wrapper carrying a CPU affinity, a private arena and a
//! request ring.
//!
//! A [`Thread`] is the unit a [`crate::domain::Domain`] starts and stops as a
//! group. Each one pins itself to a single CPU, owns an unlocked
//! [`PrivateArena`](crate::alloc::thread_local::PrivateArena) for its hot
//! allocation path, and exposes a [`Ring`] that other threads post/send
//! requests into through [`crate::fabric`].
use std::sync::Arc;

use crate::alloc::thread_local::PrivateArena;
use crate::error::{Error, Result};
use crate::event::Listener;
use crate::fabric::Request;
use crate::ring::Ring;

/// Sets the calling OS thread's CPU affinity to exactly one core.
///
/// On non-Linux targets this is a no-op: affinity is best-effort pinning,
/// not a portability requirement.
pub fn pin_to_cpu(cpu: usize) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(cpu, &mut set);
            let rc = libc::sched_setaffinity(
                0,
                std::mem::size_of::<libc::cpu_set_t>(),
                &set,
            );
            if rc != 0 {
                return Err(Error::Affinity(std::io::Error::last_os_error()));
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = cpu;
    }
    Ok(())
}

/// Per-thread state, reachable from fiber code running on that thread via
/// a thread-local handle installed by [`Thread::run`].
pub struct Thread {
    pub id: usize,
    pub cpu: usize,
    pub arena: PrivateArena,
    pub requests: Ring<{ crate::fabric::RECORD_WORDS }>,
    /// The rendez-vous object this thread's dealer fiber halts on when its
    /// ring is empty (`crate::fiber::dealer::dealer_loop`), and the target
    /// of the `thread_notify` hook `post` fires on enqueue (spec §4.3).
    pub listener: Listener,
}

// Safety: `PrivateArena` wraps an `UnsafeCell`, which is never `Sync`, so
// `Thread` doesn't derive `Sync` on its own even though every other field
// already is (`Ring`, `Listener`'s atomics/spinlock). The invariant this
// relies on is that a thread's private arena is only ever touched by the
// OS thread it belongs to -- allocation through it always runs on that
// thread's own call stack, never reached into from another thread holding
// a shared `&Thread` -- so sharing `&Thread` across threads (all
// `Arc<Thread>: Send` actually requires) never races on the arena.
unsafe impl Sync for Thread {}

thread_local! {
    static CURRENT: std::cell::RefCell<Option<Arc<Thread>>> = std::cell::RefCell::new(None);
}

impl Thread {
    pub fn new(id: usize, cpu: usize, ring_capacity: usize) -> Arc<Thread> {
        Arc::new(Thread {
            id,
            cpu,
            arena: PrivateArena::new(),
            requests: Ring::new(ring_capacity),
            listener: Listener::new(),
        })
    }

    /// Returns the handle for the thread currently executing, if any thread
    /// has installed itself via [`Thread::enter`].
    pub fn current() -> Option<Arc<Thread>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Installs `self` as the thread-local current-thread handle for the
    /// duration of `body`.
    pub fn enter<R>(self: &Arc<Thread>, body: impl FnOnce() -> R) -> R {
        let previous = CURRENT.with(|c| c.replace(Some(Arc::clone(self))));
        let result = body();
        CURRENT.with(|c| *c.borrow_mut() = previous);
        result
    }

    /// Posts a request onto this thread's ring, blocking with backoff if it
    /// is momentarily full, then notifies this thread's listener in case
    /// its dealer fiber is currently parked waiting on it.
    pub fn post(&self, request: Request) {
        self.requests.enqueue(request.into_record());
        self.listener.notify();
    }

    /// Drains one request from this thread's ring without blocking.
    pub fn poll_request(&self) -> Option<Request> {
        self.requests.get().map(Request::from_record)
    }
}
