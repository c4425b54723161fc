//! The dealer, master and worker fiber bodies: the `Role`-tagged fiber
//! every thread runs to process its request ring, and the demand-driven
//! worker pool used to act on queued work items (hash table lookups,
//! stride growth, eviction sweeps, ...).
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::fabric::Request;
use crate::thread::Thread;

use super::roles::Role;
use super::scheduler::{yield_now, Scheduler};

/// How long an idle dealer parks on its thread's listener before waking up
/// to check the ring again regardless of whether it was notified. A finite
/// bound rather than an indefinite park so a request enqueued via a path
/// that doesn't call `Thread::post` (and so never calls `notify`) can't
/// wedge the fiber forever.
pub const HALT_TIMEOUT: Duration = Duration::from_secs(10);

/// A flag threads poll once per dealer cycle to decide whether to keep
/// running. Cooperative: a thread only stops between cycles, never
/// mid-request.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        ShutdownFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_signalled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The dealer fiber body: drains the thread's request ring every cycle,
/// dispatching each request inline. Runs until `shutdown` is signalled and
/// the ring is empty.
///
/// When a cycle drains nothing, the dealer halts on `thread.listener`
/// (bounded by [`HALT_TIMEOUT`]) instead of busy-yielding: `Thread::post`
/// calls `listener.notify()` after enqueuing, so a request posted while
/// the dealer is parked wakes it immediately rather than waiting out the
/// timeout. This is the dealer's own halt point, separate from
/// [`crate::event::Dispatcher`], which coordinates *network*-FD polling
/// across several threads electing one poller per cycle -- a dealer has
/// exactly one participant (itself), so it parks on a bare
/// [`crate::event::Listener`] rather than a dispatcher it would always win
/// the election for.
pub async fn dealer_loop(thread: Arc<Thread>, shutdown: ShutdownFlag) {
    loop {
        let mut drained_any = false;
        while let Some(request) = thread.poll_request() {
            request.dispatch();
            drained_any = true;
        }
        if shutdown.is_signalled() && !drained_any {
            return;
        }
        if drained_any {
            yield_now().await;
        } else {
            thread.listener.listen(HALT_TIMEOUT);
        }
    }
}

/// A FIFO queue of opaque work items shared between a master fiber and the
/// worker fibers it spawns. Cheap to clone: all clones share the same
/// underlying queue (single-threaded -- never touched off this fiber's
/// OS thread).
pub struct WorkQueue<T> {
    items: Rc<RefCell<VecDeque<T>>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        WorkQueue {
            items: Rc::clone(&self.items),
        }
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        WorkQueue {
            items: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    pub fn push(&self, item: T) {
        self.items.borrow_mut().push_back(item);
    }

    pub fn pop(&self) -> Option<T> {
        self.items.borrow_mut().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }
}

/// The master fiber body: while `queue` is non-empty and fewer than
/// `max_workers` worker fibers are outstanding, spawns a worker fiber
/// (running `handle` on each dequeued item) on `scheduler`; otherwise
/// yields. Runs until `shutdown` is signalled and the queue has drained.
pub async fn master_loop<T: 'static>(
    scheduler: Scheduler,
    queue: WorkQueue<T>,
    max_workers: usize,
    shutdown: ShutdownFlag,
    handle: Rc<dyn Fn(T)>,
) {
    let outstanding = Rc::new(std::cell::Cell::new(0usize));
    loop {
        while outstanding.get() < max_workers && !queue.is_empty() {
            outstanding.set(outstanding.get() + 1);
            let queue = queue.clone();
            let handle = Rc::clone(&handle);
            let outstanding = Rc::clone(&outstanding);
            scheduler.spawn(Role::Worker, async move {
                worker_loop(queue, handle).await;
                outstanding.set(outstanding.get() - 1);
            });
        }
        if shutdown.is_signalled() && queue.is_empty() && outstanding.get() == 0 {
            return;
        }
        yield_now().await;
    }
}

/// The worker fiber body: drains `queue` one item at a time, running
/// `handle` on each, until the queue is empty, then returns (the fiber
/// terminates; a new one is spawned by the master next time there is
/// work).
pub async fn worker_loop<T>(queue: WorkQueue<T>, handle: Rc<dyn Fn(T)>) {
    loop {
        match queue.pop() {
            Some(item) => {
                handle(item);
                yield_now().await;
            }
            None => return,
        }
    }
}

/// Built-in two-way request: translates a syscall-shaped closure into a
/// call on the target thread and returns its result via [`Request`]'s
/// two-way variant. A thin convenience wrapper so callers don't need to
/// reach for `crate::future::send` for simple cross-thread calls that
/// don't need fiber suspension (e.g. forwarding a blocking syscall to a
/// dedicated I/O thread).
pub fn post_syscall<F>(thread: &Arc<Thread>, call: F)
where
    F: FnOnce() + Send + 'static,
{
    thread.post(Request::post(call));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn dealer_loop_drains_the_ring_then_stops_on_shutdown() {
        let scheduler = Scheduler::new();
        let thread = Thread::new(0, 0, 16);
        let shutdown = ShutdownFlag::new();
        let seen = Rc::new(Cell::new(0));

        for _ in 0..5 {
            let seen = Rc::clone(&seen);
            thread.post(Request::post(move || seen.set(seen.get() + 1)));
        }

        let t = Arc::clone(&thread);
        let sd = shutdown.clone();
        scheduler.spawn(Role::Dealer, dealer_loop(t, sd));
        scheduler.run_once(); // drains all 5, still looping (shutdown not signalled)
        assert_eq!(seen.get(), 5);
        shutdown.signal();
        scheduler.run_until_idle();
        assert!(scheduler.is_idle());
    }

    #[test]
    fn dealer_loop_halts_on_the_listener_and_wakes_on_notify() {
        let thread = Thread::new(0, 0, 16);
        let shutdown = ShutdownFlag::new();
        let ran = Arc::new(AtomicBool::new(false));

        let runner = {
            let thread = Arc::clone(&thread);
            let shutdown = shutdown.clone();
            std::thread::spawn(move || {
                let scheduler = Scheduler::new();
                scheduler.spawn(Role::Dealer, dealer_loop(thread, shutdown));
                // The first cycle drains nothing and parks on the listener;
                // `run_once` blocks here until `Thread::post` notifies it
                // below, at which point the dealer drains and loops back
                // around to park again until we signal shutdown.
                while scheduler.run_once() {}
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        let ran2 = Arc::clone(&ran);
        thread.post(Request::post(move || ran2.store(true, Ordering::SeqCst)));

        // Give the dealer a moment to drain and park again, then signal
        // shutdown and wake it so it observes the flag and returns.
        std::thread::sleep(std::time::Duration::from_millis(20));
        shutdown.signal();
        thread.listener.notify();

        runner.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn master_spawns_workers_bounded_by_max_and_drains_the_queue() {
        let scheduler = Scheduler::new();
        let queue: WorkQueue<u32> = WorkQueue::new();
        for i in 0..10 {
            queue.push(i);
        }
        let total = Rc::new(Cell::new(0u32));
        let total2 = Rc::clone(&total);
        let handle: Rc<dyn Fn(u32)> = Rc::new(move |item| total2.set(total2.get() + item));
        let shutdown = ShutdownFlag::new();

        scheduler.spawn(
            Role::Master,
            master_loop(scheduler.clone(), queue.clone(), 3, shutdown.clone(), handle),
        );
        // Run enough cycles for the queue to fully drain.
        for _ in 0..200 {
            if queue.is_empty() {
                break;
            }
            scheduler.run_once();
        }
        shutdown.signal();
        scheduler.run_until_idle();
        assert_eq!(total.get(), 45); // 0+1+...+9
    }
}
