//! A `GlobalAlloc` wrapper that feeds every allocation and free into a
//! process-wide [`AllocationLedger`].
//!
//! ```no_run
//! use std::alloc::System;
//! use lhl_heapprof::alloc::profiling::{self, ProfilingAlloc};
//!
//! #[global_allocator]
//! static GLOBAL: ProfilingAlloc<System> = ProfilingAlloc::new(System);
//!
//! fn main() {
//!     profiling::install().expect("could not start the heap profiler");
//!     let v = vec![0u8; 1 << 20];
//!     let report = profiling::report().unwrap();
//!     println!("{} bytes live", report.total_live_bytes());
//!     drop(v);
//! }
//! ```
//!
//! Nothing is recorded until [`install()`] has created the ledger. Allocations
//! made by the profiler itself (table rebuilds, logging, report building) are
//! passed straight to the inner allocator and never recorded, which is why the
//! ledger has to shrug off frees of addresses it never saw.

use std::alloc::{GlobalAlloc, Layout, System};

use once_cell::sync::OnceCell;

use crate::{
    error::LedgerError,
    ledger::{AllocationLedger, PointerInfo},
    report::Report,
    sync::{in_profiler, ProfilerScope},
    trace::StackTrace,
};

/// Frames belonging to the hook itself (`StackTrace::capture`, the hook, the
/// `__rust_alloc` shim and `alloc::alloc`), dropped from every captured stack.
pub const DEFAULT_SKIPPED_FRAMES: usize = 4;

static LEDGER: OnceCell<AllocationLedger> = OnceCell::new();

/// Create the global ledger and start recording. Calling this again returns
/// the existing ledger.
pub fn install() -> Result<&'static AllocationLedger, LedgerError> {
    let _scope = ProfilerScope::enter();
    let ledger = LEDGER.get_or_try_init(|| {
        let ledger = AllocationLedger::new()?;
        log::info!("heap profiler installed");
        Ok::<_, LedgerError>(ledger)
    })?;
    Ok(ledger)
}

/// The global ledger, if [`install()`] has run.
pub fn ledger() -> Option<&'static AllocationLedger> {
    LEDGER.get()
}

/// Build a [`Report`] from the global ledger. The report's own allocations are
/// not recorded.
pub fn report() -> Option<Report> {
    let _scope = ProfilerScope::enter();
    ledger().map(Report::from_ledger)
}

/// Wraps an inner allocator `A`, recording into the global ledger.
#[derive(Debug)]
pub struct ProfilingAlloc<A = System> {
    allocator: A,
    skipped_frames: usize,
}

impl<A> ProfilingAlloc<A> {
    pub const fn new(allocator: A) -> Self {
        Self::with_skipped_frames(allocator, DEFAULT_SKIPPED_FRAMES)
    }

    /// Like [`ProfilingAlloc::new`], dropping `skipped_frames` innermost frames
    /// from each captured stack instead of [`DEFAULT_SKIPPED_FRAMES`].
    pub const fn with_skipped_frames(allocator: A, skipped_frames: usize) -> Self {
        Self {
            allocator,
            skipped_frames,
        }
    }

    /// Return the underlying allocator
    pub const fn allocator(&self) -> &A {
        &self.allocator
    }

    fn record_alloc(&self, ptr: *mut u8, size: usize) {
        if ptr.is_null() || in_profiler() {
            return;
        }
        if let Some(ledger) = LEDGER.get() {
            self.record_alloc_into(ledger, ptr, size);
        }
    }

    fn record_alloc_into(&self, ledger: &AllocationLedger, ptr: *mut u8, size: usize) {
        // A frozen ledger would drop the record, skip the stack walk
        if !ledger.is_enabled() {
            return;
        }
        let _scope = ProfilerScope::enter();
        let trace = StackTrace::capture(self.skipped_frames);
        ledger.record_alloc(ptr as usize, size, &trace);
    }

    /// Frees are attributed to the allocating site, so no stack is captured.
    fn record_free(&self, ptr: *mut u8) {
        if ptr.is_null() || in_profiler() {
            return;
        }
        if let Some(ledger) = LEDGER.get() {
            ledger.record_free(ptr as usize, &StackTrace::empty());
        }
    }

    fn forget(&self, ptr: *mut u8) -> Option<PointerInfo> {
        if ptr.is_null() || in_profiler() {
            return None;
        }
        LEDGER.get()?.forget(ptr as usize)
    }

    fn restore(&self, ptr: *mut u8, info: PointerInfo) {
        if in_profiler() {
            return;
        }
        if let Some(ledger) = LEDGER.get() {
            ledger.restore(ptr as usize, info);
        }
    }
}

impl<A> Default for ProfilingAlloc<A>
where
    A: Default,
{
    fn default() -> Self {
        Self::new(A::default())
    }
}

unsafe impl<A> GlobalAlloc for ProfilingAlloc<A>
where
    A: GlobalAlloc,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: Same contract as the caller's
        let ptr = unsafe { self.allocator.alloc(layout) };
        self.record_alloc(ptr, layout.size());
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: Same contract as the caller's
        let ptr = unsafe { self.allocator.alloc_zeroed(layout) };
        self.record_alloc(ptr, layout.size());
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Forget the address *before* the allocator can hand it to another
        // thread, or that thread's record would look like a double allocation
        self.record_free(ptr);
        // SAFETY: Same contract as the caller's
        unsafe { self.allocator.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let old = self.forget(ptr);
        // SAFETY: Same contract as the caller's
        let new_ptr = unsafe { self.allocator.realloc(ptr, layout, new_size) };
        if new_ptr.is_null() {
            // The old block is still live, and still belongs to its site
            if let Some(info) = old {
                self.restore(ptr, info);
            }
        } else {
            self.record_alloc(new_ptr, new_size);
        }
        new_ptr
    }
}
