//! Arena allocators.
//!
//! Three arena scopes sit behind one object-safe [`Arena`] trait (an
//! `{alloc, realloc, calloc, free}` v-table):
//!
//! - [`global::GlobalArena`]: a spinlock-guarded `dlmalloc` heap, usable
//!   before any per-thread arena exists and for cross-boundary metadata.
//! - [`shared::SharedArena`]: a single mspace behind a coarser lock, for
//!   data that crosses thread boundaries (request payloads, futures).
//! - [`thread_local::PrivateArena`]: one unlocked mspace per thread.
//!
//! All three report out-of-memory by aborting the process (see
//! [`crate::error::fatal`]) — callers never observe a null/failed
//! allocation. Reallocating a pointer through a different arena than the one
//! that produced it is undefined behavior and not checked for in release
//! builds; debug builds tag allocations and assert on mismatch (see
//! [`DebugTag`]).
pub mod global;
pub mod shared;
pub mod thread_local;

use std::alloc::Layout;
use std::ptr::NonNull;

/// Object-safe allocator interface shared by all three arena scopes.
///
/// Implementations must abort the process on allocation failure rather than
/// returning a sentinel; see [`crate::error::fatal`].
pub trait Arena {
    fn alloc(&self, layout: Layout) -> NonNull<u8>;
    fn calloc(&self, layout: Layout) -> NonNull<u8>;
    unsafe fn realloc(&self, ptr: NonNull<u8>, old: Layout, new: Layout) -> NonNull<u8>;
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Debug-only allocation provenance tag, used to catch "realloc crossed an
/// arena boundary" bugs during testing without paying for the bookkeeping in
/// release builds.
#[cfg(debug_assertions)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugTag(pub u64);

#[cfg(debug_assertions)]
impl DebugTag {
    pub fn assert_matches(self, other: DebugTag) {
        if self != other {
            crate::error::fatal(format!(
                "reallocation crossed an arena boundary: allocated under tag {:?}, freed under {:?}",
                self, other
            ));
        }
    }
}
