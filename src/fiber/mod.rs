//! The cooperative fiber scheduler: priority run queues, cancellation and
//! cleanup (this module), the dealer/master/worker roles fibers play on
//! each thread (`roles`, `dealer`), and the scheduler itself
//! (`scheduler`).
pub mod cancel;
pub mod dealer;
pub mod roles;
pub mod scheduler;

pub use cancel::{cleanup_pop, cleanup_push, testcancel, Cancelled};
pub use roles::{Priority, Role, PRIORITY_BANDS};
pub use scheduler::{FiberId, Scheduler};
