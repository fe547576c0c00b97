//! The allocation ledger: which live address came from which call site, and
//! how many bytes each call site currently holds.

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use bytemuck::Zeroable;
use serde::{Deserialize, Serialize};

use crate::{
    error::{LedgerError, TableError},
    sync::HeapLock,
    table::FixedTypeHashTable,
    trace::{StackHash, StackTrace, EMPTY_STACK_HASH, REMOVED_STACK_HASH},
};

/// Address sentinels of the pointer table. Neither can be a live allocation.
pub const EMPTY_ADDRESS: usize = 0;
pub const REMOVED_ADDRESS: usize = usize::MAX;

/// What we know about one live allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct PointerInfo {
    /// The site that allocated it
    pub stack: StackHash,
    pub size: usize,
}

// SAFETY: Plain integers
unsafe impl Zeroable for PointerInfo {}

/// What we know about one call site.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct SiteInfo {
    /// The first stack seen with this hash
    pub trace: StackTrace,
    /// Bytes allocated from this site and not yet freed
    pub total_size: usize,
}

// SAFETY: `StackTrace` is `Zeroable`, the rest is an integer
unsafe impl Zeroable for SiteInfo {}

/// Occupancy of the ledger's two tables.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Distinct call sites ever seen
    pub sites: usize,
    /// Allocations currently live
    pub live_pointers: usize,
    pub site_table_bytes: usize,
    pub pointer_table_bytes: usize,
}

impl LedgerStats {
    pub fn backing_bytes(&self) -> usize {
        self.site_table_bytes + self.pointer_table_bytes
    }
}

impl fmt::Display for LedgerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MIB: f64 = (1 << 20) as f64;
        writeln!(f, "allocation sites: {}", self.sites)?;
        writeln!(f, "live allocations: {}", self.live_pointers)?;
        write!(
            f,
            "table sizes: {:.3} MiB (sites), {:.3} MiB (pointers)",
            self.site_table_bytes as f64 / MIB,
            self.pointer_table_bytes as f64 / MIB
        )
    }
}

struct Tables {
    sites: FixedTypeHashTable<StackHash, SiteInfo>,
    ptrs: FixedTypeHashTable<usize, PointerInfo>,
}

impl Tables {
    /// Every fallible step happens before any byte count changes, so a failure
    /// leaves the accounting consistent.
    fn track(&mut self, address: usize, size: usize, trace: &StackTrace) -> Result<(), TableError> {
        let site = self.sites.insert_if_absent(
            trace.hash(),
            SiteInfo {
                trace: *trace,
                total_size: 0,
            },
        )?;
        self.ptrs.insert(
            address,
            PointerInfo {
                stack: trace.hash(),
                size,
            },
        )?;
        site.total_size += size;
        Ok(())
    }

    fn untrack(&mut self, address: usize) -> Option<PointerInfo> {
        // `None` is a wild free: never seen, or already freed
        let slot = self.ptrs.slot_of(&address)?;
        let info = *self.ptrs.value_at(slot)?;
        match self.sites.find_mut(&info.stack) {
            Some(site) => site.total_size -= info.size,
            None => debug_assert!(
                false,
                "pointer {address:#x} refers to unknown site {:#x}",
                info.stack
            ),
        }
        self.ptrs.remove_at(slot);
        Some(info)
    }

    /// Put back a pointer taken out by `untrack`. Its site is still there,
    /// sites are never removed.
    fn retrack(&mut self, address: usize, info: PointerInfo) -> Result<(), TableError> {
        if !self.sites.contains_key(&info.stack) {
            debug_assert!(false, "restoring {address:#x} to unknown site {:#x}", info.stack);
            return Ok(());
        }
        self.ptrs.insert(address, info)?;
        if let Some(site) = self.sites.find_mut(&info.stack) {
            site.total_size += info.size;
        }
        Ok(())
    }
}

/// Live bytes per call site, fed by an allocation hook.
///
/// All operations take one lock for their whole duration, so they are totally
/// ordered and a [`snapshot`](AllocationLedger::snapshot) is a consistent
/// point-in-time view. None of them fail: double allocations and wild frees
/// are absorbed, and running out of memory for the tables switches the ledger
/// off rather than reaching the program being profiled.
pub struct AllocationLedger {
    tables: HeapLock<Tables>,
    /// Only ever goes from `true` to `false`, under the lock
    enabled: AtomicBool,
}

impl AllocationLedger {
    pub fn new() -> Result<Self, LedgerError> {
        Ok(Self {
            tables: HeapLock::new(Tables {
                sites: FixedTypeHashTable::new(EMPTY_STACK_HASH, REMOVED_STACK_HASH)?,
                ptrs: FixedTypeHashTable::new(EMPTY_ADDRESS, REMOVED_ADDRESS)?,
            }),
            enabled: AtomicBool::new(true),
        })
    }

    /// Record `size` bytes at `address`, allocated from `trace`.
    ///
    /// If `address` is already live this is a no-op: two live buffers can't
    /// share an address, so we would rather under-count than corrupt the
    /// totals. Sentinel addresses (null, `usize::MAX`) and traces whose hash
    /// is a site-table sentinel are ignored.
    pub fn record_alloc(&self, address: usize, size: usize, trace: &StackTrace) {
        if address == EMPTY_ADDRESS || address == REMOVED_ADDRESS {
            return;
        }
        if trace.hash() == EMPTY_STACK_HASH || trace.hash() == REMOVED_STACK_HASH {
            return;
        }
        let mut tables = self.tables.lock();
        if !self.is_enabled() || tables.ptrs.contains_key(&address) {
            return;
        }
        if let Err(err) = tables.track(address, size, trace) {
            self.disable(err);
        }
    }

    /// Record that `address` was freed. The bytes come off the site that
    /// *allocated* it, so the freeing `_trace` is not consulted. Unknown
    /// addresses are ignored.
    pub fn record_free(&self, address: usize, _trace: &StackTrace) {
        self.forget(address);
    }

    /// Like [`record_free`](AllocationLedger::record_free), returning what was
    /// known about `address` so it can be handed back to
    /// [`restore`](AllocationLedger::restore).
    pub fn forget(&self, address: usize) -> Option<PointerInfo> {
        let mut tables = self.tables.lock();
        if !self.is_enabled() {
            return None;
        }
        tables.untrack(address)
    }

    /// Undo a [`forget`](AllocationLedger::forget): `address` is live again,
    /// charged to the site that originally allocated it.
    pub fn restore(&self, address: usize, info: PointerInfo) {
        let mut tables = self.tables.lock();
        if !self.is_enabled() || tables.ptrs.contains_key(&address) {
            return;
        }
        if let Err(err) = tables.retrack(address, info) {
            self.disable(err);
        }
    }

    /// Every site ever seen with its live bytes, zero included, in no
    /// particular order.
    pub fn snapshot(&self) -> Vec<(StackTrace, usize)> {
        let tables = self.tables.lock();
        let mut sites = Vec::with_capacity(tables.sites.len());
        tables
            .sites
            .for_each(|_, site| sites.push((site.trace, site.total_size)));
        sites
    }

    /// Number of live allocations.
    pub fn live_entry_count(&self) -> usize {
        self.tables.lock().ptrs.len()
    }

    pub fn site_count(&self) -> usize {
        self.tables.lock().sites.len()
    }

    /// Bytes of table storage held by the ledger.
    pub fn backing_bytes(&self) -> usize {
        self.stats().backing_bytes()
    }

    pub fn stats(&self) -> LedgerStats {
        let tables = self.tables.lock();
        LedgerStats {
            sites: tables.sites.len(),
            live_pointers: tables.ptrs.len(),
            site_table_bytes: tables.sites.mem_size(),
            pointer_table_bytes: tables.ptrs.mem_size(),
        }
    }

    /// `false` once table storage has run out. The ledger then ignores all
    /// further allocations and frees. Does not take the lock.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Freeze the tables. Ledger operations call this with the lock held.
    pub(crate) fn disable(&self, err: TableError) {
        self.enabled.store(false, Ordering::Relaxed);
        log::error!("heap profiler disabled, ledger tables are frozen: {err}");
    }
}

impl fmt::Debug for AllocationLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationLedger")
            .field("stats", &self.stats())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
