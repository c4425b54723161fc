//! Fiber cancellation and the cleanup stack.
//!
//! Each fiber carries a small flag set and a LIFO stack of `(fn, arg)`
//! cleanup entries (modeled here as boxed closures, since Rust closures
//! already capture their "arg"). `cancel(fiber)` only ever sets
//! `CANCEL_REQUIRED`; delivery happens the next time the *cancelled* fiber
//! itself calls [`testcancel`], which is also where this implementation
//! unwinds the cleanup stack -- there is no real stack to unwind in the
//! async-fiber model (see the design notes on "coroutine control flow"),
//! so the cleanup entries are simply run here, LIFO, in place of a stack
//! unwind.
use bitflags::bitflags;

use super::scheduler::Scheduler;

bitflags! {
    #[derive(Default)]
    pub struct CancelFlags: u32 {
        const WAITING             = 0b0001;
        const CANCEL_DISABLE      = 0b0010;
        const CANCEL_ASYNCHRONOUS = 0b0100;
        const CANCEL_REQUIRED     = 0b1000;
    }
}

/// Returned by [`testcancel`] when the running fiber's cancellation has
/// just been delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Checks whether the currently running fiber has a pending, deliverable
/// cancellation (`CANCEL_REQUIRED` set and `CANCEL_DISABLE` not set); if
/// so, runs its cleanup stack LIFO and returns `Err(Cancelled)`.
///
/// No-op (returns `Ok(())`) if called outside a running fiber, since there
/// is nothing to cancel.
pub fn testcancel() -> Result<(), Cancelled> {
    let Some(scheduler) = Scheduler::current() else {
        return Ok(());
    };
    let Some(fiber) = scheduler.current_fiber() else {
        return Ok(());
    };
    let cleanup = scheduler.with_current_slot(fiber.0, |slot| {
        let deliverable = slot.flags.contains(CancelFlags::CANCEL_REQUIRED)
            && !slot.flags.contains(CancelFlags::CANCEL_DISABLE);
        if deliverable {
            Some(std::mem::take(&mut slot.cleanup))
        } else {
            None
        }
    });
    match cleanup {
        Some(handlers) => {
            for handler in handlers.into_iter().rev() {
                handler();
            }
            Err(Cancelled)
        }
        None => Ok(()),
    }
}

/// Pushes a cleanup entry onto the running fiber's cleanup stack. A no-op
/// if called outside a running fiber.
pub fn cleanup_push(f: impl FnOnce() + 'static) {
    let Some(scheduler) = Scheduler::current() else {
        return;
    };
    let Some(fiber) = scheduler.current_fiber() else {
        return;
    };
    scheduler.with_current_slot(fiber.0, |slot| slot.cleanup.push(Box::new(f)));
}

/// Pops the most recently pushed cleanup entry off the running fiber's
/// stack, running it iff `run` is true. Returns `false` if the stack was
/// empty or there is no running fiber.
pub fn cleanup_pop(run: bool) -> bool {
    let Some(scheduler) = Scheduler::current() else {
        return false;
    };
    let Some(fiber) = scheduler.current_fiber() else {
        return false;
    };
    let popped = scheduler.with_current_slot(fiber.0, |slot| slot.cleanup.pop());
    match popped {
        Some(handler) => {
            if run {
                handler();
            }
            true
        }
        None => false,
    }
}

/// Disables cancellation delivery for the duration of the returned guard,
/// restoring the previous `CANCEL_DISABLE` state on drop. A no-op guard
/// outside a running fiber.
pub struct CancelDisableGuard {
    fiber: Option<super::scheduler::FiberId>,
    scheduler: Option<Scheduler>,
    previously_disabled: bool,
}

impl Drop for CancelDisableGuard {
    fn drop(&mut self) {
        if let (Some(scheduler), Some(fiber)) = (&self.scheduler, self.fiber) {
            scheduler.with_current_slot(fiber.0, |slot| {
                slot.flags.set(CancelFlags::CANCEL_DISABLE, self.previously_disabled);
            });
        }
    }
}

pub fn cancel_disable() -> CancelDisableGuard {
    let Some(scheduler) = Scheduler::current() else {
        return CancelDisableGuard {
            fiber: None,
            scheduler: None,
            previously_disabled: false,
        };
    };
    let Some(fiber) = scheduler.current_fiber() else {
        return CancelDisableGuard {
            fiber: None,
            scheduler: None,
            previously_disabled: false,
        };
    };
    let previously_disabled = scheduler.with_current_slot(fiber.0, |slot| {
        let was = slot.flags.contains(CancelFlags::CANCEL_DISABLE);
        slot.flags.insert(CancelFlags::CANCEL_DISABLE);
        was
    });
    CancelDisableGuard {
        fiber: Some(fiber),
        scheduler: Some(scheduler),
        previously_disabled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::roles::Role;
    use crate::fiber::scheduler::yield_now;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn testcancel_is_ok_when_no_cancellation_is_pending() {
        let scheduler = Scheduler::new();
        let ok = Rc::new(RefCell::new(false));
        let ok2 = Rc::clone(&ok);
        scheduler.spawn(Role::User, async move {
            *ok2.borrow_mut() = testcancel().is_ok();
        });
        scheduler.run_until_idle();
        assert!(*ok.borrow());
    }

    #[test]
    fn cancel_runs_cleanup_handlers_in_lifo_order_and_testcancel_errs() {
        let scheduler = Scheduler::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let o1 = Rc::clone(&order);
        let o2 = Rc::clone(&order);
        let result = Rc::new(RefCell::new(None));
        let result2 = Rc::clone(&result);

        let fiber = scheduler.spawn(Role::User, async move {
            cleanup_push(move || o1.borrow_mut().push("first"));
            cleanup_push(move || o2.borrow_mut().push("second"));
            loop {
                if testcancel().is_err() {
                    *result2.borrow_mut() = Some("cancelled");
                    return;
                }
                yield_now().await;
            }
        });

        scheduler.run_once(); // let it push cleanup handlers and park on the loop
        scheduler.cancel(fiber);
        scheduler.run_until_idle();

        assert_eq!(*order.borrow(), vec!["second", "first"]);
        assert_eq!(*result.borrow(), Some("cancelled"));
    }

    #[test]
    fn cancel_disable_suppresses_delivery() {
        let scheduler = Scheduler::new();
        let saw_err = Rc::new(RefCell::new(false));
        let saw_err2 = Rc::clone(&saw_err);

        let fiber = scheduler.spawn(Role::User, async move {
            let _guard = cancel_disable();
            yield_now().await;
            *saw_err2.borrow_mut() = testcancel().is_err();
        });
        scheduler.run_once();
        scheduler.cancel(fiber);
        scheduler.run_until_idle();
        assert!(!*saw_err.borrow());
    }
}
