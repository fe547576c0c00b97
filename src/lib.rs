//! Heap profiling by call site.
//!
//! Every allocation is attributed to the stack that made it, and the crate
//! keeps a running total of live bytes per distinct stack. The pieces, bottom
//! up:
//!
//! - [`table::FixedTypeHashTable`]: an open-addressing table over `Copy` keys
//!   and values whose storage never touches the global allocator.
//! - [`ledger::AllocationLedger`]: two of those tables behind one lock,
//!   address → (site, size) and site → (stack, live bytes).
//! - [`alloc::profiling::ProfilingAlloc`]: a `GlobalAlloc` wrapper that feeds
//!   the ledger.
//! - [`report::Report`]: sorted, symbolized output.

pub mod alloc;
pub mod error;
pub mod ledger;
pub mod report;
mod serialize;
mod sync;
pub mod table;
pub mod trace;
mod util;

pub use crate::{
    alloc::profiling::ProfilingAlloc,
    error::{LedgerError, ReportError, TableError},
    ledger::{AllocationLedger, LedgerStats},
    report::Report,
    table::FixedTypeHashTable,
    trace::StackTrace,
};
