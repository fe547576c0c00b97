//! An open-addressing hash table for small, fixed-layout keys and values.
//!
//! This is deliberately *not* a general-purpose map. It exists so the
//! allocation ledger has somewhere to put its bookkeeping that does not itself
//! go through the global allocator:
//!
//! - Storage is a single power-of-two array of `(key, value)` slots, obtained
//!   from `calloc()` (see [`RawBuf`]).
//! - There is no occupied flag. Two caller-chosen sentinel keys mark a slot as
//!   never used (`empty_key`) or deleted (`removed_key`, a tombstone).
//! - Lookups probe linearly from `hash(key) & mask`. Tombstones are skipped,
//!   an empty slot ends the probe.
//! - Once live + tombstoned slots would pass 7/8 of capacity, the table is
//!   rebuilt: at double the size if more than half the slots are live,
//!   otherwise at the same size, which drops every tombstone.
//!
//! Keys are `Copy` and values are `Copy + Zeroable`. No destructor ever needs
//! to run when a slot is reused or the storage is replaced, and fresh zeroed
//! storage is a valid array of entries as soon as the keys are stamped empty.

use std::{
    fmt,
    hash::{BuildHasher, Hash},
    mem,
};

use ahash::{AHasher, RandomState};
use bytemuck::Zeroable;

use crate::{alloc::rawbuf::RawBuf, error::TableError, util::hint::cold};

/// Number of slots a new table starts with.
pub const INITIAL_CAPACITY: usize = 16;

const FIXED_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

/// The default hasher: ahash with fixed seeds. A randomly seeded
/// `RandomState` may need to allocate or read an entropy source the first
/// time it is built, neither of which is acceptable inside an allocator hook.
#[derive(Clone)]
pub struct FixedState(RandomState);

impl Default for FixedState {
    fn default() -> Self {
        let [k0, k1, k2, k3] = FIXED_SEEDS;
        Self(RandomState::with_seeds(k0, k1, k2, k3))
    }
}

impl BuildHasher for FixedState {
    type Hasher = AHasher;

    fn build_hasher(&self) -> AHasher {
        self.0.build_hasher()
    }
}

#[derive(Clone, Copy)]
#[repr(C)]
struct Entry<K, V> {
    key: K,
    value: V,
}

// SAFETY: Both fields are `Zeroable`, padding may hold anything
unsafe impl<K, V> Zeroable for Entry<K, V>
where
    K: Zeroable,
    V: Zeroable,
{
}

/// A live slot, as returned by [`FixedTypeHashTable::slot_of`]. Remembers the
/// key it was taken for, so once the slot has been reused or the table rebuilt
/// it refers to nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slot<K> {
    index: usize,
    key: K,
}

enum Probe {
    /// The key is live at this slot
    Live(usize),
    /// The key is absent. Insert at this slot, `true` if it is a tombstone
    Vacant(usize, bool),
}

pub struct FixedTypeHashTable<K, V, S = FixedState> {
    empty_key: K,
    removed_key: K,
    hasher: S,
    cells: RawBuf<Entry<K, V>>,
    cells_mask: usize,
    /// Live entries
    elements_cnt: usize,
    /// Live entries + tombstones
    used_cnt: usize,
}

impl<K, V> FixedTypeHashTable<K, V, FixedState>
where
    K: Copy + Eq + Hash + Zeroable,
    V: Copy + Zeroable,
{
    /// Create a table with [`INITIAL_CAPACITY`] slots, all `empty_key`.
    ///
    /// # Errors
    ///
    /// - [`TableError::SentinelCollision`] if `empty_key == removed_key`
    /// - [`TableError::OutOfMemory`] if the initial storage can't be acquired
    pub fn new(empty_key: K, removed_key: K) -> Result<Self, TableError> {
        Self::with_hasher(empty_key, removed_key, FixedState::default())
    }
}

impl<K, V, S> FixedTypeHashTable<K, V, S>
where
    K: Copy + Eq + Hash + Zeroable,
    V: Copy + Zeroable,
    S: BuildHasher,
{
    /// Like [`FixedTypeHashTable::new`], with a caller-supplied hasher.
    pub fn with_hasher(empty_key: K, removed_key: K, hasher: S) -> Result<Self, TableError> {
        if empty_key == removed_key {
            return Err(TableError::SentinelCollision);
        }
        Ok(Self {
            cells: Self::allocate(empty_key, INITIAL_CAPACITY)?,
            cells_mask: INITIAL_CAPACITY - 1,
            empty_key,
            removed_key,
            hasher,
            elements_cnt: 0,
            used_cnt: 0,
        })
    }

    fn allocate(empty_key: K, cnt: usize) -> Result<RawBuf<Entry<K, V>>, TableError> {
        debug_assert!(cnt.is_power_of_two());
        let mut cells = RawBuf::<Entry<K, V>>::zeroed(cnt)?;
        for cell in cells.as_mut_slice() {
            cell.key = empty_key;
        }
        Ok(cells)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.elements_cnt
    }

    pub fn is_empty(&self) -> bool {
        self.elements_cnt == 0
    }

    /// Number of slots (always a power of two).
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Number of non-empty slots: live entries plus tombstones.
    pub fn used(&self) -> usize {
        self.used_cnt
    }

    /// Bytes of backing storage currently held.
    pub fn mem_size(&self) -> usize {
        self.capacity() * mem::size_of::<Entry<K, V>>()
    }

    fn is_live(&self, key: &K) -> bool {
        *key != self.empty_key && *key != self.removed_key
    }

    fn home(&self, key: &K) -> usize {
        self.hasher.hash_one(key) as usize & self.cells_mask
    }

    /// Find `key` among live slots. The load limit guarantees at least one
    /// empty slot, so this terminates.
    fn probe(&self, key: &K) -> Option<usize> {
        if !self.is_live(key) {
            return None;
        }
        let cells = self.cells.as_slice();
        let mut i = self.home(key);
        while cells[i].key != self.empty_key {
            if cells[i].key == *key {
                return Some(i);
            }
            i = (i + 1) & self.cells_mask;
        }
        None
    }

    fn probe_for_insert(&self, key: &K) -> Probe {
        let cells = self.cells.as_slice();
        let mut i = self.home(key);
        let mut removed = None;
        while cells[i].key != self.empty_key {
            if cells[i].key == *key {
                return Probe::Live(i);
            }
            if cells[i].key == self.removed_key && removed.is_none() {
                removed = Some(i);
            }
            i = (i + 1) & self.cells_mask;
        }
        match removed {
            Some(removed) => Probe::Vacant(removed, true),
            None => Probe::Vacant(i, false),
        }
    }

    pub fn find(&self, key: &K) -> Option<&V> {
        let i = self.probe(key)?;
        Some(&self.cells.as_slice()[i].value)
    }

    pub fn find_mut(&mut self, key: &K) -> Option<&mut V> {
        let i = self.probe(key)?;
        Some(&mut self.cells.as_mut_slice()[i].value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.probe(key).is_some()
    }

    /// Locate the slot holding `key`, for a later [`remove_at`].
    ///
    /// [`remove_at`]: FixedTypeHashTable::remove_at
    pub fn slot_of(&self, key: &K) -> Option<Slot<K>> {
        self.probe(key).map(|index| Slot { index, key: *key })
    }

    /// The value stored at `slot`, or `None` if the slot no longer holds the
    /// key it was taken for.
    pub fn value_at(&self, slot: Slot<K>) -> Option<&V> {
        let cell = self.cells.as_slice().get(slot.index)?;
        (self.is_live(&cell.key) && cell.key == slot.key).then_some(&cell.value)
    }

    /// Insert `key`, overwriting the value if it is already present.
    ///
    /// # Errors
    ///
    /// - [`TableError::SentinelKey`] if `key` is one of the sentinels
    /// - [`TableError::OutOfMemory`] if this insert had to rebuild the table
    ///   and the new storage could not be acquired
    ///
    /// The table is unchanged on error.
    pub fn insert(&mut self, key: K, value: V) -> Result<&mut V, TableError> {
        self.insert_with(key, value, true)
    }

    /// Insert `key` only if it is absent. Either way, return the value now
    /// stored under `key`.
    pub fn insert_if_absent(&mut self, key: K, value: V) -> Result<&mut V, TableError> {
        self.insert_with(key, value, false)
    }

    fn insert_with(&mut self, key: K, value: V, overwrite: bool) -> Result<&mut V, TableError> {
        if !self.is_live(&key) {
            return Err(TableError::SentinelKey);
        }
        let cells_cnt = self.capacity();
        if self.used_cnt + 1 > cells_cnt - cells_cnt / 8 {
            cold(|| self.handle_overflow())?;
        }
        Ok(self.place(key, value, overwrite))
    }

    /// Insert without checking the load limit. The caller has made room.
    fn place(&mut self, key: K, value: V, overwrite: bool) -> &mut V {
        let i = match self.probe_for_insert(&key) {
            Probe::Live(i) => {
                let cell = &mut self.cells.as_mut_slice()[i];
                if overwrite {
                    cell.value = value;
                }
                return &mut cell.value;
            }
            Probe::Vacant(i, reused_tombstone) => {
                if reused_tombstone {
                    self.used_cnt -= 1;
                }
                i
            }
        };
        self.elements_cnt += 1;
        self.used_cnt += 1;
        let cell = &mut self.cells.as_mut_slice()[i];
        *cell = Entry { key, value };
        &mut cell.value
    }

    /// Rebuild into fresh storage, doubling only if more than half of the
    /// slots are live. New storage is acquired before anything is torn down.
    fn handle_overflow(&mut self) -> Result<(), TableError> {
        let old_cnt = self.capacity();
        let new_cnt = if self.elements_cnt > old_cnt / 2 {
            old_cnt
                .checked_mul(2)
                .ok_or(TableError::CapacityOverflow)?
        } else {
            old_cnt
        };
        log::trace!(
            "rehash: {} live, {} tombstones, {} -> {} cells",
            self.elements_cnt,
            self.used_cnt - self.elements_cnt,
            old_cnt,
            new_cnt
        );

        let old_cells = mem::replace(&mut self.cells, Self::allocate(self.empty_key, new_cnt)?);
        self.cells_mask = new_cnt - 1;
        self.elements_cnt = 0;
        self.used_cnt = 0;
        for cell in old_cells.as_slice() {
            if self.is_live(&cell.key) {
                self.place(cell.key, cell.value, true);
            }
        }
        Ok(())
    }

    /// Remove `key`, returning its value if it was live. The slot becomes a
    /// tombstone and keeps counting towards [`used`](FixedTypeHashTable::used)
    /// until the next rebuild.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.slot_of(key)?;
        self.remove_at(slot)
    }

    /// Remove the entry at `slot`, returning its value. A stale slot is left
    /// alone and yields `None`.
    pub fn remove_at(&mut self, slot: Slot<K>) -> Option<V> {
        let removed_key = self.removed_key;
        let value = *self.value_at(slot)?;
        self.cells.as_mut_slice()[slot.index].key = removed_key;
        self.elements_cnt -= 1;
        Some(value)
    }

    /// Call `f` on every live entry, in storage order.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(K, &V),
    {
        for (key, value) in self.iter() {
            f(key, value);
        }
    }

    /// Iterate live entries in storage order. The order is unrelated to
    /// insertion order and changes whenever the table is rebuilt.
    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> + '_ {
        self.cells
            .as_slice()
            .iter()
            .filter(|cell| self.is_live(&cell.key))
            .map(|cell| (cell.key, &cell.value))
    }
}

impl<K, V, S> fmt::Debug for FixedTypeHashTable<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedTypeHashTable")
            .field("len", &self.elements_cnt)
            .field("used", &self.used_cnt)
            .field("capacity", &self.cells.len())
            .finish()
    }
}
