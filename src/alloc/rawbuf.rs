use std::{
    mem,
    ptr::{self, NonNull},
    slice,
};

use bytemuck::Zeroable;

use crate::{
    error::TableError,
    util::{assert::aligned_to, hint::cold},
};

/// An owning, zero-initialized buffer of `len` `T`s.
///
/// The memory comes straight from `libc::calloc()` and goes back through
/// `libc::free()`, so it never passes through the Rust global allocator. That
/// matters because the whole point of this buffer is to back tables that live
/// *inside* a global allocator hook: if we went through `std::alloc` we would
/// recursively call ourselves.
///
/// `T: Zeroable` is what makes handing out `&[T]` straight after `calloc()`
/// sound.
pub struct RawBuf<T> {
    data: NonNull<T>,
    len: usize,
}

// SAFETY: `RawBuf` uniquely owns its elements, same as `Box<[T]>`
unsafe impl<T> Send for RawBuf<T> where T: Send {}
// SAFETY: Shared access only hands out `&[T]`
unsafe impl<T> Sync for RawBuf<T> where T: Sync {}

impl<T> RawBuf<T>
where
    T: Zeroable,
{
    /// Allocate `len` zeroed elements.
    ///
    /// # Errors
    ///
    /// - [`TableError::CapacityOverflow`] if `len * size_of::<T>()` does not
    ///   fit in a `usize`
    /// - [`TableError::OutOfMemory`] if `calloc()` returns null. Nothing is
    ///   leaked in this case.
    pub fn zeroed(len: usize) -> Result<Self, TableError> {
        let bytes = mem::size_of::<T>()
            .checked_mul(len)
            .ok_or(TableError::CapacityOverflow)?;
        if bytes == 0 {
            return Ok(Self {
                data: NonNull::dangling(),
                len,
            });
        }

        // SAFETY: `calloc()` has no preconditions, a null return is handled
        let data = unsafe { libc::calloc(len, mem::size_of::<T>()) } as *mut T;
        let Some(data) = NonNull::new(data) else {
            return cold(|| Err(TableError::OutOfMemory { cells: len, bytes }));
        };
        // `calloc()` aligns for any fundamental type, table entries never ask
        // for more than that
        debug_assert!(aligned_to(data.as_ptr(), mem::align_of::<T>()));
        Ok(Self { data, len })
    }
}

impl<T> RawBuf<T> {
    pub const fn len(&self) -> usize {
        self.len
    }

    pub fn as_slice(&self) -> &[T] {
        // SAFETY:
        // - `data` is valid for `len` reads, zeroed at construction and `T` is
        //   `Zeroable` (or dangling with a zero-byte extent)
        // - We own the buffer, so no `&mut` aliases it while `&self` is live
        unsafe { slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: As for `as_slice()`, and `&mut self` makes this unique
        unsafe { slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }
}

impl<T> Drop for RawBuf<T> {
    fn drop(&mut self) {
        if mem::size_of::<T>() == 0 || self.len == 0 {
            return;
        }
        // SAFETY:
        // - Elements are never read again
        // - Any drop glue runs here, before the storage goes away
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(
                self.data.as_ptr(),
                self.len,
            ));
        }
        // SAFETY: `data` came from `calloc()` and is freed exactly once
        unsafe { libc::free(self.data.as_ptr().cast()) }
    }
}

#[cfg(test)]
mod tests {
    use super::RawBuf;

    #[test]
    fn zeroed_buffer_reads_back_zero() {
        let buf = RawBuf::<u64>::zeroed(128).unwrap();
        assert_eq!(buf.len(), 128);
        assert!(buf.as_slice().iter().all(|&n| n == 0));
    }

    #[test]
    fn writes_are_visible_through_as_slice() {
        let mut buf = RawBuf::<usize>::zeroed(4).unwrap();
        buf.as_mut_slice()[2] = 0xdead;
        assert_eq!(buf.as_slice(), &[0, 0, 0xdead, 0]);
    }

    #[test]
    fn zero_length_buffer_is_empty() {
        let buf = RawBuf::<u32>::zeroed(0).unwrap();
        assert_eq!(buf.len(), 0);
        assert!(buf.as_slice().is_empty());
    }

    #[test]
    fn oversized_buffer_is_reported() {
        assert!(RawBuf::<u64>::zeroed(usize::MAX).is_err());
    }
}
