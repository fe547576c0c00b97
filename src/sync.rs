//! The ledger lock, and the per-thread flag that lets the allocation hook tell
//! when it is being re-entered by the profiler itself.
//!
//! Both of these have to work from inside a `GlobalAlloc` implementation, so
//! neither may allocate. The lock is a plain futex word: `0` is unlocked, `1`
//! is locked, and contending threads sleep in `futex(FUTEX_WAIT)` until the
//! holder wakes them on release.

use std::{
    cell::{Cell, UnsafeCell},
    fmt,
    ops::{Deref, DerefMut},
    sync::atomic::Ordering,
};

use linux_futex::{Futex, Private};

/// This futex represents a lock and is unlocked
const FUTEX_UNLOCKED: u32 = 0;

/// This futex represents a lock and is locked
const FUTEX_LOCKED: u32 = 1;

thread_local! {
    static IN_PROFILER: Cell<bool> = const { Cell::new(false) };
}

/// Is the current thread already inside the profiler (holding the ledger lock,
/// capturing a backtrace, building a report)? Anything the hook sees while this
/// is `true` must go straight to the inner allocator.
///
/// A thread whose TLS has already been torn down reports `true`.
pub fn in_profiler() -> bool {
    IN_PROFILER.try_with(Cell::get).unwrap_or(true)
}

/// RAII marker for "this thread is inside the profiler". Restores the previous
/// value on drop, so scopes nest.
#[must_use]
pub struct ProfilerScope {
    prev: bool,
}

impl ProfilerScope {
    pub fn enter() -> Self {
        let prev = IN_PROFILER.try_with(|flag| flag.replace(true)).unwrap_or(true);
        Self { prev }
    }
}

impl Drop for ProfilerScope {
    fn drop(&mut self) {
        _ = IN_PROFILER.try_with(|flag| flag.set(self.prev));
    }
}

/// A futex mutex that never allocates. Holding the guard also holds a
/// [`ProfilerScope`], so any allocation made under the lock is invisible to the
/// hook (and cannot deadlock on this lock).
pub struct HeapLock<T> {
    writer_lock: Futex<Private>,
    data: UnsafeCell<T>,
}

// SAFETY: Access to `data` is serialized by `writer_lock`
unsafe impl<T> Sync for HeapLock<T> where T: Send {}

impl<T> HeapLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            writer_lock: Futex::new(FUTEX_UNLOCKED),
            data: UnsafeCell::new(data),
        }
    }

    /// Block until we own the lock.
    pub fn lock(&self) -> HeapLockGuard<'_, T> {
        let scope = ProfilerScope::enter();
        while !self.try_acquire() {}
        HeapLockGuard {
            lock: self,
            _scope: scope,
        }
    }

    /// Attempt to take the lock. If another thread holds it, sleep until it is
    /// released and return `false`, in which case the caller must retry.
    fn try_acquire(&self) -> bool {
        if self
            .writer_lock
            .value
            .compare_exchange(
                FUTEX_UNLOCKED,
                FUTEX_LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            true
        } else {
            // Returns immediately if the holder released in the meantime
            _ = self.writer_lock.wait(FUTEX_LOCKED);
            false
        }
    }

    fn release(&self) {
        self.writer_lock
            .value
            .store(FUTEX_UNLOCKED, Ordering::Release);
        self.writer_lock.wake(1);
    }
}

impl<T> fmt::Debug for HeapLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapLock")
            .field(
                "writer_lock",
                &self.writer_lock.value.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

pub struct HeapLockGuard<'a, T> {
    lock: &'a HeapLock<T>,
    _scope: ProfilerScope,
}

impl<T> Deref for HeapLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: We hold the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for HeapLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: We hold the lock, and `&mut self` makes this unique
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for HeapLockGuard<'_, T> {
    fn drop(&mut self) {
        // `_scope` is dropped after this, so the flag stays up until the lock
        // is released
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::{in_profiler, HeapLock, ProfilerScope};

    #[test]
    fn guard_serializes_increments() {
        let counter = HeapLock::new(0usize);
        crossbeam::scope(|s| {
            for _ in 0..8 {
                s.spawn(|_| {
                    for _ in 0..10_000 {
                        *counter.lock() += 1;
                    }
                });
            }
        })
        .unwrap();
        assert_eq!(*counter.lock(), 80_000);
    }

    #[test]
    fn guard_marks_thread_as_in_profiler() {
        let lock = HeapLock::new(());
        assert!(!in_profiler());
        {
            let _guard = lock.lock();
            assert!(in_profiler());
        }
        assert!(!in_profiler());
    }

    #[test]
    fn scopes_nest() {
        let outer = ProfilerScope::enter();
        {
            let _inner = ProfilerScope::enter();
            assert!(in_profiler());
        }
        assert!(in_profiler());
        drop(outer);
        assert!(!in_profiler());
    }
}
