//! Error taxonomy.
//!
//! The runtime distinguishes three classes of failure (see the design docs):
//! **fatal** (OOM, broken invariants, thread-primitive failures) abort the
//! process; **operational** failures are logged and the operation is retried
//! or skipped; **recoverable** failures are returned to the caller as plain
//! `Result`s or sentinel values.
use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Recoverable and operational failures that can cross an API boundary.
///
/// Fatal failures (allocator OOM, broken ring/thread invariants) never show
/// up here: they go through [`fatal`] and abort the process instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("ring is full")]
    RingFull,

    #[error("ring is empty")]
    RingEmpty,

    #[error("entry not found")]
    NotFound,

    #[error("entry already exists")]
    Exists,

    #[error("cas mismatch: expected {expected}, found {found}")]
    CasMismatch { expected: u64, found: u64 },

    #[error("value is not numeric")]
    NotNumeric,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("operation timed out")]
    TimedOut,

    #[error("future was not started")]
    NotStarted,

    #[error("failed to set thread affinity: {0}")]
    Affinity(std::io::Error),

    #[error("os thread primitive failed: {0}")]
    ThreadPrimitive(std::io::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Aborts the process with a diagnostic including the call site.
///
/// This is the only acceptable response to allocator OOM and to internal
/// invariant breakage (ring sequence corruption, a partition observed from
/// the wrong thread, ...). Callers of the allocator APIs never see `null`;
/// callers of invariant-checked APIs never see `Err` for these cases.
#[cold]
#[track_caller]
pub fn fatal(message: impl fmt::Display) -> ! {
    let location = std::panic::Location::caller();
    log::error!(target: "mainmemory::fatal", "{} at {}:{}:{}", message, location.file(), location.line(), location.column());
    std::process::abort()
}

/// Shorthand for aborting when a condition that must always hold does not.
#[macro_export]
macro_rules! invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::error::fatal(format!($($arg)+));
        }
    };
}
