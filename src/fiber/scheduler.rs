//! A single-threaded, priority-banded, cooperative scheduler.
//!
//! Every OS thread owns exactly one `Scheduler`. A fiber is modeled as a
//! boxed `Future<Output = ()>` living in a slab; "running a fiber" means
//! polling that future once with a waker that, when invoked, re-links the
//! fiber onto its priority's run queue. This is the same shape as the
//! teacher's `fiber::async`-style "one task, run to completion on this
//! thread" helper, generalized from one task to many, time-sliced one poll
//! at a time across eight priority bands (see [`super::roles`]).
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::list::{Index, Linked, Links, List, Slab};

use super::cancel::CancelFlags;
use super::roles::{Priority, Role, PRIORITY_BANDS};

type BoxedFuture = Pin<Box<dyn Future<Output = ()>>>;
pub(crate) type CleanupEntry = Box<dyn FnOnce()>;

pub(crate) struct FiberSlot {
    future: Option<BoxedFuture>,
    links: Links,
    priority: Priority,
    pub(crate) flags: CancelFlags,
    pub(crate) cleanup: Vec<CleanupEntry>,
}

impl Linked for FiberSlot {
    fn links(&mut self) -> &mut Links {
        &mut self.links
    }
}

/// A handle identifying a fiber within its owning scheduler.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FiberId(pub(crate) Index);

struct Inner {
    slab: Slab<FiberSlot>,
    run_queues: [List; PRIORITY_BANDS],
    /// Fibers woken while they are already running (by their own waker,
    /// re-entrantly) cannot be re-linked into a run queue mid-poll since
    /// their slot is briefly empty; they are marked here instead and
    /// re-queued by `run_once` right after the poll returns.
    wake_pending: Vec<Index>,
    current: Option<Index>,
}

/// The cooperative scheduler owned by one OS thread. Not `Send`/`Sync`: a
/// scheduler, and the fibers inside it, never cross a thread boundary.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<RefCell<Inner>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Scheduler>> = RefCell::new(None);
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            inner: Rc::new(RefCell::new(Inner {
                slab: Slab::new(),
                run_queues: std::array::from_fn(|_| List::new()),
                wake_pending: Vec::new(),
                current: None,
            })),
        }
    }

    /// Installs `self` as the thread-local "current scheduler" for the
    /// duration of `body`. `testcancel`/`cleanup_push`/`cleanup_pop` reach
    /// the running fiber's bookkeeping through this handle.
    pub fn enter<R>(&self, body: impl FnOnce() -> R) -> R {
        let previous = CURRENT_SCHEDULER.with(|c| c.replace(Some(self.clone())));
        let result = body();
        CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = previous);
        result
    }

    /// The scheduler currently running on this OS thread, if any.
    pub fn current() -> Option<Scheduler> {
        CURRENT_SCHEDULER.with(|c| c.borrow().clone())
    }

    /// Spawns a fiber under `role`'s priority band, runnable on the next
    /// cycle.
    pub fn spawn(&self, role: Role, future: impl Future<Output = ()> + 'static) -> FiberId {
        let priority = role.priority();
        let mut inner = self.inner.borrow_mut();
        let index = inner.slab.insert(FiberSlot {
            future: Some(Box::pin(future)),
            links: Links::default(),
            priority,
            flags: CancelFlags::empty(),
            cleanup: Vec::new(),
        });
        inner.run_queues[priority.index()].push_back_linked(&mut inner.slab, index);
        FiberId(index)
    }

    /// Requests cancellation of `fiber`. Delivered the next time that
    /// fiber calls `testcancel` (or immediately, at its next suspension
    /// point, if it has `CANCEL_ASYNCHRONOUS` set -- suspension points are
    /// exactly where `testcancel` is called from in this scheduler, so the
    /// two cases coincide here).
    pub fn cancel(&self, fiber: FiberId) {
        let mut inner = self.inner.borrow_mut();
        inner.slab.get_mut(fiber.0).flags |= CancelFlags::CANCEL_REQUIRED;
    }

    /// Runs one fiber to its next suspension point, draining `Boot` before
    /// `System` before ... before `Background`. Returns `false` if there
    /// was nothing runnable.
    pub fn run_once(&self) -> bool {
        let index = {
            let mut inner = self.inner.borrow_mut();
            (0..PRIORITY_BANDS)
                .rev()
                .find_map(|band| inner.run_queues[band].pop_front(&mut inner.slab))
        };
        let Some(index) = index else { return false };

        let waker = make_waker(Rc::clone(&self.inner), index);
        let mut cx = Context::from_waker(&waker);

        let mut future = {
            let mut inner = self.inner.borrow_mut();
            inner.current = Some(index);
            inner
                .slab
                .get_mut(index)
                .future
                .take()
                .expect("fiber polled while already running")
        };

        let poll = self.enter(|| future.as_mut().poll(&mut cx));

        let mut inner = self.inner.borrow_mut();
        inner.current = None;
        match poll {
            Poll::Ready(()) => {
                inner.slab.remove(index);
            }
            Poll::Pending => {
                inner.slab.get_mut(index).future = Some(future);
                if let Some(pos) = inner.wake_pending.iter().position(|w| *w == index) {
                    inner.wake_pending.remove(pos);
                    let priority = inner.slab.get_mut(index).priority;
                    inner.run_queues[priority.index()].push_back_linked(&mut inner.slab, index);
                }
            }
        }
        true
    }

    /// Drains every runnable fiber until none remain ready (fibers parked
    /// on external events stay parked; this returns once the thread would
    /// otherwise have nothing to do but wait).
    pub fn run_until_idle(&self) {
        while self.run_once() {}
    }

    pub fn is_idle(&self) -> bool {
        let inner = self.inner.borrow();
        inner.run_queues.iter().all(List::is_empty)
    }

    /// The fiber currently being polled on this thread, if any.
    pub fn current_fiber(&self) -> Option<FiberId> {
        self.inner.borrow().current.map(FiberId)
    }

    pub(crate) fn with_current_slot<R>(&self, index: Index, f: impl FnOnce(&mut FiberSlot) -> R) -> R {
        let mut inner = self.inner.borrow_mut();
        f(inner.slab.get_mut(index))
    }
}

fn make_waker(inner: Rc<RefCell<Inner>>, index: Index) -> Waker {
    let data = Box::into_raw(Box::new(WakerData { inner, index })) as *const ();
    unsafe { Waker::from_raw(RawWaker::new(data, &VTABLE)) }
}

struct WakerData {
    inner: Rc<RefCell<Inner>>,
    index: Index,
}

fn wake_index(inner: &Rc<RefCell<Inner>>, index: Index) {
    let mut inner = inner.borrow_mut();
    if inner.current == Some(index) {
        // The fiber is waking itself (or being woken) from inside its own
        // poll; its slot has no future to re-link right now, so remember
        // the request and requeue once `run_once` regains control.
        if !inner.wake_pending.contains(&index) {
            inner.wake_pending.push(index);
        }
        return;
    }
    let already_queued = inner.slab.get(index).future.is_none();
    if already_queued {
        return;
    }
    let priority = inner.slab.get_mut(index).priority;
    inner.run_queues[priority.index()].push_back_linked(&mut inner.slab, index);
}

unsafe fn clone_raw(data: *const ()) -> RawWaker {
    let ptr = data as *const WakerData;
    let new = Box::new(WakerData {
        inner: Rc::clone(&(*ptr).inner),
        index: (*ptr).index,
    });
    RawWaker::new(Box::into_raw(new) as *const (), &VTABLE)
}

unsafe fn wake_raw(data: *const ()) {
    let boxed = Box::from_raw(data as *mut WakerData);
    wake_index(&boxed.inner, boxed.index);
}

unsafe fn wake_by_ref_raw(data: *const ()) {
    let ptr = data as *const WakerData;
    wake_index(&(*ptr).inner, (*ptr).index);
}

unsafe fn drop_raw(data: *const ()) {
    drop(Box::from_raw(data as *mut WakerData));
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone_raw, wake_raw, wake_by_ref_raw, drop_raw);

/// A future that is ready on its second poll, having yielded once on the
/// first. `await`ing this is how a fiber voluntarily returns control to the
/// scheduler without actually suspending on anything.
pub struct Yield {
    yielded: bool,
}

impl Yield {
    pub fn new() -> Self {
        Yield { yielded: false }
    }
}

impl Default for Yield {
    fn default() -> Self {
        Self::new()
    }
}

impl Future for Yield {
    type Output = ();
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Yields the currently running fiber, placing it at the tail of its
/// priority band's run queue.
pub async fn yield_now() {
    Yield::new().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn a_fiber_that_yields_once_completes_after_two_polls() {
        let scheduler = Scheduler::new();
        let ran = Rc::new(Cell::new(0));
        let ran_clone = Rc::clone(&ran);
        scheduler.spawn(Role::User, async move {
            yield_now().await;
            ran_clone.set(ran_clone.get() + 1);
        });
        scheduler.run_until_idle();
        assert_eq!(ran.get(), 1);
    }

    #[test]
    fn higher_priority_band_drains_before_lower() {
        let scheduler = Scheduler::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = Rc::clone(&order);
        scheduler.spawn(Role::Background, async move {
            o.borrow_mut().push("background");
        });
        let o = Rc::clone(&order);
        scheduler.spawn(Role::Dealer, async move {
            o.borrow_mut().push("dealer");
        });
        let o = Rc::clone(&order);
        scheduler.spawn(Role::Boot, async move {
            o.borrow_mut().push("boot");
        });
        let o = Rc::clone(&order);
        scheduler.spawn(Role::User, async move {
            o.borrow_mut().push("user");
        });

        scheduler.run_until_idle();
        assert_eq!(*order.borrow(), vec!["boot", "dealer", "user", "background"]);
    }

    #[test]
    fn spawning_many_fibers_and_draining_them_leaves_the_scheduler_idle() {
        let scheduler = Scheduler::new();
        let count = Rc::new(Cell::new(0));
        for _ in 0..100 {
            let count = Rc::clone(&count);
            scheduler.spawn(Role::User, async move {
                count.set(count.get() + 1);
            });
        }
        scheduler.run_until_idle();
        assert_eq!(count.get(), 100);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn current_scheduler_is_installed_while_a_fiber_runs() {
        let scheduler = Scheduler::new();
        let saw_current = Rc::new(Cell::new(false));
        let saw = Rc::clone(&saw_current);
        scheduler.spawn(Role::User, async move {
            saw.set(Scheduler::current().is_some());
        });
        assert!(Scheduler::current().is_none());
        scheduler.run_until_idle();
        assert!(saw_current.get());
        assert!(Scheduler::current().is_none());
    }
}
