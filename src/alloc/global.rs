//! The process-global arena: a spinlock-guarded `dlmalloc` heap.
//!
//! Used before any per-thread arena has been installed (startup code, the
//! allocator itself bootstrapping) and for small pieces of metadata that
//! cross thread boundaries without a more specific arena to live in.
use std::alloc::Layout;
use std::ptr::NonNull;

use dlmalloc::Dlmalloc;

use crate::alloc::Arena;
use crate::sync::Spinlock;

pub struct GlobalArena {
    inner: Spinlock<Dlmalloc>,
}

impl Default for GlobalArena {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalArena {
    pub fn new() -> Self {
        GlobalArena {
            inner: Spinlock::new(Dlmalloc::new()),
        }
    }
}

impl Arena for GlobalArena {
    fn alloc(&self, layout: Layout) -> NonNull<u8> {
        let mut dl = self.inner.lock();
        let ptr = unsafe { dl.malloc(layout.size(), layout.align()) };
        NonNull::new(ptr).unwrap_or_else(|| {
            crate::error::fatal(format!(
                "global arena out of memory allocating {} bytes (align {})",
                layout.size(),
                layout.align()
            ))
        })
    }

    fn calloc(&self, layout: Layout) -> NonNull<u8> {
        let mut dl = self.inner.lock();
        let ptr = unsafe { dl.calloc(layout.size(), layout.align()) };
        NonNull::new(ptr).unwrap_or_else(|| {
            crate::error::fatal(format!(
                "global arena out of memory callocating {} bytes (align {})",
                layout.size(),
                layout.align()
            ))
        })
    }

    unsafe fn realloc(&self, ptr: NonNull<u8>, old: Layout, new: Layout) -> NonNull<u8> {
        let mut dl = self.inner.lock();
        let raw = dl.realloc(ptr.as_ptr(), old.size(), old.align(), new.size());
        NonNull::new(raw).unwrap_or_else(|| {
            crate::error::fatal(format!(
                "global arena out of memory reallocating to {} bytes",
                new.size()
            ))
        })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        let mut dl = self.inner.lock();
        dl.free(ptr.as_ptr(), layout.size(), layout.align());
    }
}

/// The single process-wide instance, lazily created on first use.
pub static GLOBAL: once_cell::sync::Lazy<GlobalArena> = once_cell::sync::Lazy::new(GlobalArena::new);
