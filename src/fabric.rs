//! The cross-thread/cross-domain request fabric: one-way posts and two-way
//! sends, carried over the fixed-capacity [`Ring`](crate::ring::Ring).
//!
//! A request is a tagged [`Request`] enum rather than a bare closure: a
//! one-way post (`Request::OneWay`) just runs for its side effects, while a
//! two-way send (`Request::TwoWay`) carries both the job and an explicit
//! response sink, so the two kinds are distinguished by which variant a
//! request is, never by inspecting what the closure happens to do inside.
//! [`send`]/[`send_blocking`] build on `TwoWay` to let a caller get a
//! result back, either by suspending the calling fiber ([`send`], via
//! [`crate::future::TaskFuture`]) or by blocking the calling OS thread
//! ([`send_blocking`]).
use std::any::Any;
use std::sync::Arc;

use crate::ring::Ring;
use crate::thread::Thread;

/// Width, in machine words, of a request record: `Request` is boxed as one
/// sized value and carried as a single thin pointer.
pub const RECORD_WORDS: usize = 1;

/// A single fabric message, tagged by whether the sender expects a
/// response back.
pub enum Request {
    /// Run for side effects only; nothing is sent back.
    OneWay(Box<dyn FnOnce() + Send>),
    /// Run `job` on the target thread, then hand its (type-erased) result
    /// to `respond`, which is responsible for getting it back to the
    /// sender (a completion slot, a `TaskFuture::finish` call, ...).
    TwoWay {
        job: Box<dyn FnOnce() -> Box<dyn Any + Send> + Send>,
        respond: Box<dyn FnOnce(Box<dyn Any + Send>) + Send>,
    },
}

impl Request {
    /// Wraps an arbitrary closure as a one-way post.
    pub fn post(job: impl FnOnce() + Send + 'static) -> Request {
        Request::OneWay(Box::new(job))
    }

    /// Runs the request on the thread that dequeued it: a one-way request
    /// just runs, a two-way request runs `job` and feeds the result to
    /// `respond`.
    pub fn dispatch(self) {
        match self {
            Request::OneWay(job) => job(),
            Request::TwoWay { job, respond } => respond(job()),
        }
    }

    pub(crate) fn into_record(self) -> [usize; RECORD_WORDS] {
        let boxed: Box<Request> = Box::new(self);
        [Box::into_raw(boxed) as usize]
    }

    pub(crate) fn from_record(record: [usize; RECORD_WORDS]) -> Request {
        // Safety: the record was produced by a previous `into_record` call
        // on a `Box<Request>` and has not been read since.
        let raw = record[0] as *mut Request;
        *unsafe { Box::from_raw(raw) }
    }
}

/// Builds a two-way request out of a typed job and a typed response
/// closure, erasing `T` behind `dyn Any` for the trip through [`Request`]
/// and restoring it on the other side. `respond`'s downcast can only fail
/// if a caller hand-builds a mismatched `TwoWay` some other way, which
/// nothing in this crate does.
pub(crate) fn send_request<T: Send + 'static>(
    thread: &Arc<Thread>,
    job: impl FnOnce() -> T + Send + 'static,
    respond: impl FnOnce(T) + Send + 'static,
) {
    let job: Box<dyn FnOnce() -> Box<dyn Any + Send> + Send> =
        Box::new(move || Box::new(job()) as Box<dyn Any + Send>);
    let respond: Box<dyn FnOnce(Box<dyn Any + Send>) + Send> = Box::new(move |boxed| {
        let result = *boxed.downcast::<T>().expect("response type mismatch");
        respond(result);
    });
    thread.post(Request::TwoWay { job, respond });
}

/// Posts a one-way request onto `thread`'s ring, blocking (with backoff) if
/// the ring is momentarily full. The closure runs on `thread`'s own stack
/// once it drains its ring.
pub fn post(thread: &Arc<Thread>, job: impl FnOnce() + Send + 'static) {
    thread.post(Request::post(job));
}

/// Sends a two-way request to `thread`: posts `job` and returns a
/// [`crate::future::TaskFuture`] the caller can `.await` from a fiber to
/// suspend (rather than block the OS thread) until `job`'s result lands.
/// This is the fiber-aware counterpart to [`send_blocking`]: a post
/// combined with response registration.
pub fn send<T: Send + 'static>(
    thread: &Arc<Thread>,
    job: impl FnOnce() -> T + Send + 'static,
) -> crate::future::TaskFuture<T> {
    let future = crate::future::TaskFuture::new();
    future.start(thread, job);
    future
}

/// Sends a two-way request to `thread` and blocks the *calling OS thread*
/// (not a fiber) until the receiver runs the closure and fills in the
/// result.
///
/// Fiber-aware callers should prefer [`send`], which suspends the calling
/// fiber instead of blocking the whole thread.
pub fn send_blocking<T: Send + 'static>(
    thread: &Arc<Thread>,
    job: impl FnOnce() -> T + Send + 'static,
) -> T {
    let slot: Arc<crate::sync::Spinlock<Option<T>>> = Arc::new(crate::sync::Spinlock::new(None));
    let completion = Arc::clone(&slot);
    send_request(thread, job, move |result| {
        *completion.lock() = Some(result);
    });
    let mut backoff = crate::backoff::Backoff::new();
    loop {
        if let Some(result) = slot.lock().take() {
            return result;
        }
        backoff.spin();
    }
}

pub(crate) fn ring_for(capacity: usize) -> Ring<RECORD_WORDS> {
    Ring::new(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn post_dispatch_invokes_closure() {
        static SEEN: AtomicUsize = AtomicUsize::new(0);
        let request = Request::post(|| SEEN.store(42, Ordering::SeqCst));
        request.dispatch();
        assert_eq!(SEEN.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn record_round_trip_preserves_the_closure() {
        static SEEN: AtomicUsize = AtomicUsize::new(0);
        let request = Request::post(|| SEEN.store(7, Ordering::SeqCst));
        let record = request.into_record();
        let request = Request::from_record(record);
        request.dispatch();
        assert_eq!(SEEN.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn two_way_request_round_trips_its_typed_result() {
        let slot: Arc<crate::sync::Spinlock<Option<i32>>> = Arc::new(crate::sync::Spinlock::new(None));
        let completion = Arc::clone(&slot);
        let job: Box<dyn FnOnce() -> Box<dyn Any + Send> + Send> =
            Box::new(|| Box::new(6 * 7) as Box<dyn Any + Send>);
        let respond: Box<dyn FnOnce(Box<dyn Any + Send>) + Send> = Box::new(move |boxed| {
            *completion.lock() = Some(*boxed.downcast::<i32>().unwrap());
        });
        let request = Request::TwoWay { job, respond };
        assert!(matches!(request, Request::TwoWay { .. }));
        let record = request.into_record();
        Request::from_record(record).dispatch();
        assert_eq!(*slot.lock(), Some(42));
    }

    #[test]
    fn thread_post_and_poll_round_trips_a_request() {
        let thread = Thread::new(0, 0, 16);
        static SEEN: AtomicUsize = AtomicUsize::new(0);
        thread.post(Request::post(|| SEEN.store(9, Ordering::SeqCst)));
        let request = thread.poll_request().expect("request should be queued");
        request.dispatch();
        assert_eq!(SEEN.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn send_blocking_returns_the_receivers_result() {
        let thread = Thread::new(0, 0, 16);
        let handle = {
            let thread = Arc::clone(&thread);
            std::thread::spawn(move || send_blocking(&thread, || 1 + 1))
        };
        // Drain the request on what stands in for the owning thread.
        loop {
            if let Some(request) = thread.poll_request() {
                request.dispatch();
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(handle.join().unwrap(), 2);
    }

    #[test]
    fn send_future_resolves_once_the_target_thread_drains_it() {
        let thread = Thread::new(0, 0, 16);
        let future = send(&thread, || 6 * 7);
        let request = thread.poll_request().expect("send should post a request");
        request.dispatch();

        let scheduler = crate::fiber::scheduler::Scheduler::new();
        let result = std::rc::Rc::new(std::cell::RefCell::new(None));
        let result2 = std::rc::Rc::clone(&result);
        scheduler.spawn(crate::fiber::roles::Role::User, async move {
            *result2.borrow_mut() = Some(future.wait().await);
        });
        scheduler.run_until_idle();
        assert_eq!(*result.borrow(), Some(Ok(42)));
    }
}
