//! Allocation-counting wrapper around the system allocator.
//!
//! Install it in a binary with `#[global_allocator]`. Counting is always on,
//! so a run costs the same per allocation whether or not anything reads the
//! count. Work done inside [`untracked`] on the current thread is not counted.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

static ALLOCATIONS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static UNTRACKED: Cell<bool> = const { Cell::new(false) };
}

pub struct CountingAllocator;

impl CountingAllocator {
    #[inline(always)]
    fn record(&self) {
        // No TLS slot during thread teardown; count those.
        if !UNTRACKED.try_with(Cell::get).unwrap_or(false) {
            ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        }
    }
}

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.record();
        System.alloc(layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.record();
        System.alloc_zeroed(layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.record();
        System.realloc(ptr, layout, new_size)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }
}

/// Cumulative allocation calls (including reallocations) since startup.
pub fn allocation_count() -> u64 {
    ALLOCATIONS.load(Ordering::Relaxed)
}

/// Run `f` with counting suspended on this thread.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    struct Restore(bool);

    impl Drop for Restore {
        fn drop(&mut self) {
            UNTRACKED.with(|u| u.set(self.0));
        }
    }

    let _restore = Restore(UNTRACKED.with(|u| u.replace(true)));
    f()
}
