//! Allocation-side plumbing: the hook that feeds the ledger, and the raw
//! storage its tables live in.

pub mod profiling;
pub(crate) mod rawbuf;
