//! Futures and waitsets.
//!
//! A [`TaskFuture`] holds a result slot (`Deferred | NotReady | Cancelled |
//! Ready(T)`) and a [`Waitset`] of parked waiters. `start` posts the task
//! to a thread via [`crate::fabric`]; `wait`/`timedwait` suspend the
//! *calling fiber* (not the OS thread) until the result lands or the
//! deadline passes. Cancellation of a running task is best-effort: `cancel`
//! only ever sets a flag the task's own `testcancel` calls observe.
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use crate::fiber::scheduler::yield_now;

/// A queue of fibers parked in a task-locked critical section, woken
/// either all at once (`wake_all`, used by [`TaskFuture::finish`]) or one
/// at a time (`wake_one`). Reusable anywhere a waitset is needed beyond a
/// single future's result slot.
#[derive(Default)]
pub struct Waitset {
    wakers: Mutex<Vec<Waker>>,
}

impl Waitset {
    pub fn new() -> Self {
        Waitset::default()
    }

    /// Registers `waker` to be woken by a future `wake_all`/`wake_one`
    /// call. Idempotent enough for repeated polls of the same future:
    /// callers typically replace their registration each poll via
    /// `Waker::will_wake`-style dedup, which this keeps simple by just
    /// appending -- a spuriously-woken extra poll is harmless.
    pub fn register(&self, waker: Waker) {
        self.wakers.lock().unwrap_or_else(|e| e.into_inner()).push(waker);
    }

    pub fn wake_all(&self) {
        let wakers = std::mem::take(&mut *self.wakers.lock().unwrap_or_else(|e| e.into_inner()));
        for waker in wakers {
            waker.wake();
        }
    }

    pub fn wake_one(&self) {
        let mut guard = self.wakers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(waker) = guard.pop() {
            drop(guard);
            waker.wake();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Deferred,
    NotReady,
    Cancelled,
    Ready,
}

struct Inner<T> {
    state: Mutex<(State, Option<T>)>,
    waitset: Waitset,
    cancel_requested: AtomicBool,
}

/// A handle to an asynchronous result, startable on a target thread and
/// awaitable from any fiber holding a clone of the handle.
pub struct TaskFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TaskFuture<T> {
    fn clone(&self) -> Self {
        TaskFuture {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Default for TaskFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Sentinel returned by [`TaskFuture::wait`]/`timedwait` when the future
/// was cancelled before completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Returned by [`TaskFuture::timedwait`] when the deadline passes before a
/// result (or cancellation) is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut;

impl<T: Send + 'static> TaskFuture<T> {
    pub fn new() -> Self {
        TaskFuture {
            inner: Arc::new(Inner {
                state: Mutex::new((State::Deferred, None)),
                waitset: Waitset::new(),
                cancel_requested: AtomicBool::new(false),
            }),
        }
    }

    /// CAS `Deferred -> NotReady`, then posts `task` to `thread`. Returns
    /// `false` (no-op) if the future had already been started.
    pub fn start(&self, thread: &Arc<crate::thread::Thread>, task: impl FnOnce() -> T + Send + 'static) -> bool {
        {
            let mut guard = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if guard.0 != State::Deferred {
                return false;
            }
            guard.0 = State::NotReady;
        }
        let this = self.clone();
        crate::fabric::send_request(thread, task, move |result| this.finish(result));
        true
    }

    /// Stores `result`, fences, and wakes every parked waiter. A future
    /// that was cancelled before its task finished still has its result
    /// stored (best-effort cancellation: the task ran to completion
    /// regardless), but `wait` observes `Cancelled`, not the result.
    pub fn finish(&self, result: T) {
        let mut guard = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if guard.0 != State::Cancelled {
            guard.0 = State::Ready;
            guard.1 = Some(result);
        }
        drop(guard);
        self.inner.waitset.wake_all();
    }

    /// Requests cancellation. If the task has not started running
    /// (`Deferred`), takes effect immediately. Otherwise best-effort: the
    /// flag is set, but whether a running task observes it is up to the
    /// task's own cancellation points.
    pub fn cancel(&self) {
        self.inner.cancel_requested.store(true, Ordering::Release);
        let mut guard = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if guard.0 == State::Deferred {
            guard.0 = State::Cancelled;
            drop(guard);
            self.inner.waitset.wake_all();
        }
    }

    /// Whether `cancel` has been called, regardless of whether it has
    /// taken effect yet. A task's own body can poll this as its
    /// cancellation point.
    pub fn cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::Acquire)
    }

    /// Suspends the calling fiber until the result lands or the future is
    /// cancelled.
    pub async fn wait(&self) -> Result<T, Cancelled> {
        WaitFuture { future: self }.await
    }

    /// As `wait`, but gives up and returns `Err(Ok(TimedOut))`-shaped
    /// control once `deadline` passes. Polls cooperatively (yielding
    /// between checks) rather than relying on a timer wheel, since the
    /// core has none; a real timer-driven wake is an optimization, not a
    /// correctness requirement, for a deadline this coarse.
    pub async fn timedwait(&self, deadline: Instant) -> Result<Result<T, Cancelled>, TimedOut> {
        loop {
            {
                let mut guard = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
                match guard.0 {
                    State::Ready => return Ok(Ok(guard.1.take().expect("ready without a result"))),
                    State::Cancelled => return Ok(Err(Cancelled)),
                    _ => {}
                }
            }
            if Instant::now() >= deadline {
                return Err(TimedOut);
            }
            yield_now().await;
        }
    }
}

struct WaitFuture<'a, T> {
    future: &'a TaskFuture<T>,
}

impl<'a, T: Send + 'static> Future for WaitFuture<'a, T> {
    type Output = Result<T, Cancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self
            .future
            .inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match guard.0 {
            State::Ready => Poll::Ready(Ok(guard.1.take().expect("ready without a result"))),
            State::Cancelled => Poll::Ready(Err(Cancelled)),
            State::Deferred | State::NotReady => {
                drop(guard);
                self.future.inner.waitset.register(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::roles::Role;
    use crate::fiber::scheduler::Scheduler;
    use crate::thread::Thread;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    #[test]
    fn start_then_wait_observes_the_computed_result() {
        let thread = Thread::new(0, 0, 16);
        let future: TaskFuture<i32> = TaskFuture::new();
        future.start(&thread, || 2 + 2);
        // drive the posted task since nothing else is running the thread's ring
        let request = thread.poll_request().expect("task should have been posted");
        request.dispatch();

        let scheduler = Scheduler::new();
        let result = Rc::new(RefCell::new(None));
        let result2 = Rc::clone(&result);
        let future2 = future.clone();
        scheduler.spawn(Role::User, async move {
            *result2.borrow_mut() = Some(future2.wait().await);
        });
        scheduler.run_until_idle();
        assert_eq!(*result.borrow(), Some(Ok(4)));
    }

    #[test]
    fn cancelling_before_start_completes_is_observed_as_cancelled() {
        let future: TaskFuture<i32> = TaskFuture::new();
        future.cancel();

        let scheduler = Scheduler::new();
        let result = Rc::new(RefCell::new(None));
        let result2 = Rc::clone(&result);
        let future2 = future.clone();
        scheduler.spawn(Role::User, async move {
            *result2.borrow_mut() = Some(future2.wait().await);
        });
        scheduler.run_until_idle();
        assert_eq!(*result.borrow(), Some(Err(Cancelled)));
    }

    #[test]
    fn waitset_wakes_all_registered_waiters() {
        let waitset = Arc::new(Waitset::new());
        let woken = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        struct Once {
            waitset: Arc<Waitset>,
            woken: Arc<std::sync::atomic::AtomicUsize>,
            registered: bool,
        }
        impl Future for Once {
            type Output = ();
            fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
                if self.registered {
                    self.woken.fetch_add(1, Ordering::SeqCst);
                    Poll::Ready(())
                } else {
                    self.registered = true;
                    self.waitset.register(cx.waker().clone());
                    Poll::Pending
                }
            }
        }

        let scheduler = Scheduler::new();
        for _ in 0..5 {
            let waitset = Arc::clone(&waitset);
            let woken = Arc::clone(&woken);
            scheduler.spawn(Role::User, async move {
                Once {
                    waitset,
                    woken,
                    registered: false,
                }
                .await
            });
        }
        scheduler.run_once(); // everyone registers and parks
        waitset.wake_all();
        scheduler.run_until_idle();
        assert_eq!(woken.load(Ordering::SeqCst), 5);
    }
}
