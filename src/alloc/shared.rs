//! The cross-core shared arena: a single `dlmalloc` mspace behind a
//! task-level lock, used for data that is allocated on one thread but may be
//! freed on another (request payloads, future result boxes).
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Mutex;

use dlmalloc::Dlmalloc;

use crate::alloc::Arena;

pub struct SharedArena {
    inner: Mutex<Dlmalloc>,
}

impl Default for SharedArena {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedArena {
    pub fn new() -> Self {
        SharedArena {
            inner: Mutex::new(Dlmalloc::new()),
        }
    }
}

impl Arena for SharedArena {
    fn alloc(&self, layout: Layout) -> NonNull<u8> {
        let mut dl = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let ptr = unsafe { dl.malloc(layout.size(), layout.align()) };
        NonNull::new(ptr).unwrap_or_else(|| {
            crate::error::fatal(format!(
                "shared arena out of memory allocating {} bytes",
                layout.size()
            ))
        })
    }

    fn calloc(&self, layout: Layout) -> NonNull<u8> {
        let mut dl = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let ptr = unsafe { dl.calloc(layout.size(), layout.align()) };
        NonNull::new(ptr).unwrap_or_else(|| {
            crate::error::fatal(format!(
                "shared arena out of memory callocating {} bytes",
                layout.size()
            ))
        })
    }

    unsafe fn realloc(&self, ptr: NonNull<u8>, old: Layout, new: Layout) -> NonNull<u8> {
        let mut dl = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let raw = dl.realloc(ptr.as_ptr(), old.size(), old.align(), new.size());
        NonNull::new(raw).unwrap_or_else(|| {
            crate::error::fatal(format!(
                "shared arena out of memory reallocating to {} bytes",
                new.size()
            ))
        })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        let mut dl = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        dl.free(ptr.as_ptr(), layout.size(), layout.align());
    }
}

/// The single process-wide shared arena instance.
pub static SHARED: once_cell::sync::Lazy<SharedArena> =
    once_cell::sync::Lazy::new(SharedArena::new);
