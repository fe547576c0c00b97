use std::io;

use thiserror::Error;

/// Failures of [`FixedTypeHashTable`](crate::table::FixedTypeHashTable).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum TableError {
    /// `calloc()` refused to hand out backing storage.
    #[error("could not acquire {bytes} bytes of backing storage for {cells} cells")]
    OutOfMemory { cells: usize, bytes: usize },
    /// Doubling the capacity (or sizing the buffer in bytes) overflowed `usize`.
    #[error("table capacity overflowed usize")]
    CapacityOverflow,
    /// The empty and removed sentinels were the same key.
    #[error("the empty and removed sentinel keys must differ")]
    SentinelCollision,
    /// The key to insert was the empty or removed sentinel.
    #[error("sentinel keys cannot be inserted")]
    SentinelKey,
}

/// Failures building an [`AllocationLedger`](crate::ledger::AllocationLedger).
/// Once built, the ledger never reports errors to its callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("could not build ledger table: {0}")]
    Table(#[from] TableError),
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report io failed: {0}")]
    IoError(#[from] io::Error),
    #[error("report json failed: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
}
