//! Per-thread heap accounting for sandbox workers.
//!
//! Every allocation made through the process allocator is tallied against
//! the thread that made it. A script host samples the tally before a run and
//! compares it while the script executes, which bounds everything the script
//! holds at once rather than any single value.
//!
//! Memory freed on a different thread than it was allocated on skews both
//! tallies. Hosts only ever compare against a baseline taken on their own
//! thread within one run, so the drift never matters.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

/// System allocator that keeps a running per-thread byte count.
pub struct MeteredAlloc;

#[global_allocator]
static ALLOCATOR: MeteredAlloc = MeteredAlloc;

thread_local! {
    static LIVE_BYTES: Cell<isize> = const { Cell::new(0) };
}

fn adjust(delta: isize) {
    // Fails only while the thread is being torn down.
    let _ = LIVE_BYTES.try_with(|live| live.set(live.get().wrapping_add(delta)));
}

fn signed(size: usize) -> isize {
    isize::try_from(size).unwrap_or(isize::MAX)
}

unsafe impl GlobalAlloc for MeteredAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            adjust(signed(layout.size()));
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            adjust(signed(layout.size()));
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        adjust(-signed(layout.size()));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            adjust(signed(new_size).wrapping_sub(signed(layout.size())));
        }
        new_ptr
    }
}

/// Net bytes allocated by the current thread so far.
pub fn live_bytes() -> isize {
    LIVE_BYTES.try_with(Cell::get).unwrap_or(0)
}
