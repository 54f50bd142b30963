// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Sequential writes into mapped buffer memory.

use std::marker::PhantomData;
use std::ptr::NonNull;

use bytemuck::Pod;

/// A window of a CPU-mapped buffer object to be filled front to back.
///
/// Obtained from [`Bo::writer`](crate::Bo::writer). The window borrows the
/// buffer, so the mapping outlives it.
pub struct BufWrite<'a> {
    ptr: NonNull<u8>,
    len: usize,
    capacity: usize,
    _phantom: PhantomData<&'a mut [u8]>,
}

impl BufWrite<'_> {
    /// # Safety
    ///
    /// `ptr` must be valid for writes of `capacity` bytes for the lifetime of
    /// the returned value, and nothing else may access that memory meanwhile.
    pub(crate) unsafe fn new(ptr: NonNull<u8>, capacity: usize) -> Self {
        BufWrite {
            ptr,
            len: 0,
            capacity,
            _phantom: PhantomData,
        }
    }

    /// Append a plain data object to the buffer.
    ///
    /// Panics if capacity is inadequate.
    #[inline]
    pub fn push(&mut self, item: &impl Pod) {
        self.push_bytes(bytemuck::bytes_of(item));
    }

    /// Extend with a slice of plain data objects.
    ///
    /// Panics if capacity is inadequate.
    #[inline]
    pub fn extend_slice(&mut self, slice: &[impl Pod]) {
        self.push_bytes(bytemuck::cast_slice(slice));
    }

    /// Extend with a byte slice.
    ///
    /// Panics if capacity is inadequate.
    #[inline]
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let len = bytes.len();
        assert!(self.capacity - self.len >= len);
        // SAFETY: the assert keeps the write inside the window.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(self.len), len);
        }
        self.len += len;
    }

    /// Extend with zeros.
    ///
    /// Panics if capacity is inadequate.
    #[inline]
    pub fn fill_zero(&mut self, len: usize) {
        assert!(self.capacity - self.len >= len);
        // SAFETY: the assert keeps the write inside the window.
        unsafe {
            std::ptr::write_bytes(self.ptr.as_ptr().add(self.len), 0, len);
        }
        self.len += len;
    }

    /// The total capacity of the window, in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of bytes still available.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.len
    }
}

impl std::ops::Deref for BufWrite<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        // SAFETY: the first `len` bytes have been written through this window.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl std::ops::DerefMut for BufWrite<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as for `Deref`, and we hold the only access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Pod> std::iter::Extend<T> for BufWrite<'_> {
    /// Truncates rather than panicking when the window fills up.
    fn extend<I>(&mut self, iter: I)
    where
        I: IntoIterator<Item = T>,
    {
        let item_size = std::mem::size_of::<T>();
        if item_size == 0 {
            return;
        }
        for item in iter.into_iter().take(self.remaining() / item_size) {
            self.push(&item);
        }
    }
}
