// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Buffer objects.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::mem::ManuallyDrop;
use std::os::fd::{AsFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bufwrite::BufWrite;
use crate::kernel::{absolute_timeout, BoAccess, VaOp};
use crate::screen::{BoTable, Entry, ScreenInner};
use crate::{Error, Result};

/// The ways a buffer can be shared with other processes and APIs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// A global GEM name from flink.
    SharedName,
    /// The kernel handle itself, meaningful only on the same device file.
    KmsHandle,
    /// A dma-buf file descriptor.
    DmaBuf,
}

/// A buffer shared with, or received from, another process or API.
#[derive(Debug)]
pub enum ExternalHandle {
    SharedName(u32),
    KmsHandle(u32),
    DmaBuf(OwnedFd),
}

impl ExternalHandle {
    pub fn kind(&self) -> HandleKind {
        match self {
            Self::SharedName(_) => HandleKind::SharedName,
            Self::KmsHandle(_) => HandleKind::KmsHandle,
            Self::DmaBuf(_) => HandleKind::DmaBuf,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct CpuMapping(NonNull<u8>);

// SAFETY: the mapping is shared memory owned by the buffer object, not by any
// thread.
unsafe impl Send for CpuMapping {}

#[derive(Debug, Default)]
struct BoState {
    /// mmap offset, queried once.
    offset: Option<u64>,
    map: Option<CpuMapping>,
    va: Option<u32>,
    flink_name: Option<u32>,
}

pub(crate) struct BoInner {
    screen: Arc<ScreenInner>,
    handle: u32,
    size: u32,
    state: Mutex<BoState>,
}

impl BoInner {
    fn state(&self) -> MutexGuard<'_, BoState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Releases everything the buffer holds.
    ///
    /// Runs without the table lock. The table keeps the dead entries until
    /// the handle is closed, so imports of the same handle wait instead of
    /// reviving it.
    fn teardown(self) {
        let Self {
            screen,
            handle,
            size,
            state,
        } = self;
        let state = state.into_inner().unwrap_or_else(PoisonError::into_inner);
        log::debug!("bo: free handle {handle}");
        if let Some(va) = state.va {
            if let Err(errno) = screen.kernel.gem_va(handle, VaOp::Unmap, va) {
                log::warn!("bo: unmapping handle {handle} from {va:#x} failed: {errno}");
            }
            if let Err(err) = screen.va().free(u64::from(va), u64::from(size)) {
                log::warn!("bo: releasing VA of handle {handle} failed: {err}");
            }
        }
        if let Some(CpuMapping(ptr)) = state.map {
            // SAFETY: the mapping was created by `update` and no `BufWrite`
            // can outlive the last reference.
            if let Err(errno) = unsafe { screen.kernel.munmap(ptr, size as usize) } {
                log::warn!("bo: munmap of handle {handle} failed: {errno}");
            }
        }
        if let Err(errno) = screen.kernel.gem_close(handle) {
            log::warn!("bo: closing handle {handle} failed: {errno}");
        }
        screen.forget(handle, state.flink_name);
    }
}

/// A reference counted buffer object.
///
/// Clones share the buffer. When the last reference is dropped the buffer is
/// unmapped from the GPU, its address range is returned, the CPU mapping is
/// removed and the kernel handle is closed, in that order.
pub struct Bo {
    // Always populated; only taken in `drop`.
    inner: ManuallyDrop<Arc<BoInner>>,
}

impl Bo {
    pub(crate) fn from_inner(inner: Arc<BoInner>) -> Self {
        Self {
            inner: ManuallyDrop::new(inner),
        }
    }

    fn register(
        screen: &Arc<ScreenInner>,
        table: &mut BoTable,
        handle: u32,
        size: u32,
        flink_name: Option<u32>,
    ) -> Self {
        let inner = Arc::new(BoInner {
            screen: screen.clone(),
            handle,
            size,
            state: Mutex::new(BoState {
                flink_name,
                ..Default::default()
            }),
        });
        table.handles.insert(handle, Arc::downgrade(&inner));
        if let Some(name) = flink_name {
            table.names.insert(name, Arc::downgrade(&inner));
        }
        Self::from_inner(inner)
    }

    pub(crate) fn create(screen: &Arc<ScreenInner>, size: u32, flags: u32) -> Result<Self> {
        let obj = screen
            .kernel
            .gem_create(size, flags)
            .map_err(Error::AllocationFailed)?;
        log::debug!("bo: create handle {} size {:#x}", obj.handle, obj.size);
        let mut table = screen.table();
        Ok(Self::register(screen, &mut table, obj.handle, obj.size, None))
    }

    /// Looks `handle` up after the kernel returned it for an import.
    ///
    /// `None` means the handle belongs to a buffer that was being torn down
    /// and is closed now, so the kernel call has to be repeated.
    fn adopt(
        screen: &Arc<ScreenInner>,
        handle: u32,
        size: u32,
        name: Option<u32>,
    ) -> Option<Self> {
        let mut table = screen.table();
        match table.handle_entry(handle) {
            Entry::Live(bo) => {
                if let Some(name) = name {
                    bo.inner.state().flink_name = Some(name);
                    table.names.insert(name, Arc::downgrade(&bo.inner));
                }
                Some(bo)
            }
            Entry::Vacant => {
                log::debug!("bo: import handle {handle} size {size:#x}");
                Some(Self::register(screen, &mut table, handle, size, name))
            }
            Entry::Closing => {
                log::debug!("bo: import raced with closing handle {handle}, retrying");
                drop(screen.wait_closed(table, handle));
                None
            }
        }
    }

    pub(crate) fn import(screen: &Arc<ScreenInner>, handle: ExternalHandle) -> Result<Self> {
        match handle {
            ExternalHandle::SharedName(name) => loop {
                if let Entry::Live(bo) = screen.table().name_entry(name) {
                    return Ok(bo);
                }
                let obj = screen.kernel.gem_open(name)?;
                // Another thread may have opened the same name meanwhile.
                let winner = match screen.table().name_entry(name) {
                    Entry::Live(bo) if bo.handle() != obj.handle => Some(bo),
                    _ => None,
                };
                if let Some(bo) = winner {
                    if let Err(errno) = screen.kernel.gem_close(obj.handle) {
                        log::warn!("bo: closing duplicate handle {} failed: {errno}", obj.handle);
                    }
                    return Ok(bo);
                }
                if let Some(bo) = Self::adopt(screen, obj.handle, obj.size, Some(name)) {
                    return Ok(bo);
                }
            },
            ExternalHandle::KmsHandle(handle) => screen
                .table()
                .by_handle(handle)
                .ok_or(Error::InvalidHandle(handle)),
            ExternalHandle::DmaBuf(fd) => {
                // The kernel handle carries no size, so take it from the file
                // before registering anything.
                let mut file = File::from(fd);
                let size = file.seek(SeekFrom::End(0))?;
                let size = u32::try_from(size).map_err(|_| Error::ProtocolMismatch {
                    expected: u64::from(u32::MAX),
                    actual: size,
                })?;
                loop {
                    let handle = screen.kernel.prime_fd_to_handle(file.as_fd())?;
                    if let Some(bo) = Self::adopt(screen, handle, size, None) {
                        return Ok(bo);
                    }
                }
            }
        }
    }

    pub fn handle(&self) -> u32 {
        self.inner.handle
    }

    /// Whether the buffer was created on, or imported into, `screen`.
    pub(crate) fn belongs_to(&self, screen: &Arc<ScreenInner>) -> bool {
        Arc::ptr_eq(&self.inner.screen, screen)
    }

    /// Size in bytes, as rounded up by the kernel.
    pub fn size(&self) -> u32 {
        self.inner.size
    }

    /// The GPU virtual address, once assigned by [`Bo::update`].
    pub fn va(&self) -> Option<u32> {
        self.inner.state().va
    }

    pub fn is_mapped(&self) -> bool {
        self.inner.state().map.is_some()
    }

    /// Number of live references, including this one.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether both references name the same buffer.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Makes sure the buffer has a CPU mapping and/or a GPU address.
    ///
    /// Work already done is not repeated. If the GPU mapping fails, its
    /// address range is released but a CPU mapping made by the same call is
    /// kept.
    pub fn update(&self, need_map: bool, need_va: bool) -> Result<()> {
        let inner = &*self.inner;
        let kernel = &inner.screen.kernel;
        let mut state = inner.state();
        if need_map && state.map.is_none() {
            let offset = match state.offset {
                Some(offset) => offset,
                None => {
                    let offset = kernel.gem_info(inner.handle)?;
                    state.offset = Some(offset);
                    offset
                }
            };
            // SAFETY: the offset belongs to our live handle, and `teardown`
            // unmaps before closing it.
            let ptr = unsafe { kernel.mmap(offset, inner.size as usize)? };
            state.map = Some(CpuMapping(ptr));
        }
        if need_va && state.va.is_none() {
            let size = u64::from(inner.size);
            let va = inner.screen.va().alloc(size)?;
            let va32 = match u32::try_from(va) {
                Ok(va32) => va32,
                Err(_) => {
                    inner.screen.va().free(va, size)?;
                    return Err(Error::OutOfVaSpace);
                }
            };
            if let Err(errno) = kernel.gem_va(inner.handle, VaOp::Map, va32) {
                inner.screen.va().free(va, size)?;
                return Err(errno.into());
            }
            log::debug!("bo: handle {} at {va32:#x}", inner.handle);
            state.va = Some(va32);
        }
        Ok(())
    }

    /// Removes the CPU mapping.
    ///
    /// Returns `false` and keeps the mapping while other references to the
    /// buffer exist, since they may be writing through it.
    pub fn unmap(&mut self) -> Result<bool> {
        let inner = &*self.inner;
        let _table = inner.screen.table();
        if Arc::strong_count(&self.inner) != 1 {
            return Ok(false);
        }
        let mut state = inner.state();
        if let Some(CpuMapping(ptr)) = state.map.take() {
            // SAFETY: we hold the only reference and `&mut self` rules out
            // a live `BufWrite` from it.
            unsafe { inner.screen.kernel.munmap(ptr, inner.size as usize)? };
        }
        Ok(true)
    }

    /// Shares the buffer.
    pub fn export(&self, kind: HandleKind) -> Result<ExternalHandle> {
        let inner = &*self.inner;
        let kernel = &inner.screen.kernel;
        match kind {
            HandleKind::SharedName => {
                let name = {
                    let mut state = inner.state();
                    match state.flink_name {
                        Some(name) => name,
                        None => {
                            let name = kernel.gem_flink(inner.handle)?;
                            state.flink_name = Some(name);
                            name
                        }
                    }
                };
                inner
                    .screen
                    .table()
                    .names
                    .insert(name, Arc::downgrade(&self.inner));
                Ok(ExternalHandle::SharedName(name))
            }
            HandleKind::KmsHandle => {
                let mut table = inner.screen.table();
                table
                    .handles
                    .insert(inner.handle, Arc::downgrade(&self.inner));
                Ok(ExternalHandle::KmsHandle(inner.handle))
            }
            HandleKind::DmaBuf => {
                inner
                    .screen
                    .table()
                    .handles
                    .insert(inner.handle, Arc::downgrade(&self.inner));
                let fd = kernel.prime_handle_to_fd(inner.handle)?;
                Ok(ExternalHandle::DmaBuf(fd))
            }
        }
    }

    /// Waits until the GPU is done with the buffer for `access`.
    ///
    /// `READ` waits for pending GPU writes, `WRITE` for every pending GPU
    /// access.
    pub fn wait(&self, access: BoAccess, timeout_ns: u64, relative: bool) -> Result<()> {
        let deadline = absolute_timeout(timeout_ns, relative)?;
        self.inner
            .screen
            .kernel
            .gem_wait(self.inner.handle, access, deadline)
            .map_err(Error::from_wait)
    }

    fn mapped_range(&self, offset: u32, len: usize) -> Result<NonNull<u8>> {
        let end = u64::from(offset) + len as u64;
        if end > u64::from(self.inner.size) {
            return Err(Error::InvalidRange {
                offset: u64::from(offset),
                size: len as u64,
            });
        }
        self.update(true, false)?;
        let CpuMapping(ptr) = self.inner.state().map.ok_or(Error::InvalidRange {
            offset: u64::from(offset),
            size: len as u64,
        })?;
        // SAFETY: `offset` lies within the mapping, checked above.
        Ok(unsafe { ptr.add(offset as usize) })
    }

    /// Copies `bytes` into the buffer at `offset`, mapping it if needed.
    pub fn write(&self, offset: u32, bytes: &[u8]) -> Result<()> {
        let ptr = self.mapped_range(offset, bytes.len())?;
        // SAFETY: the range is inside the mapping, which lives as long as `self`.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len()) };
        Ok(())
    }

    /// Copies `len` bytes out of the buffer at `offset`, mapping it if needed.
    ///
    /// This does not wait for the GPU; see [`Bo::wait`].
    pub fn read(&self, offset: u32, len: usize) -> Result<Vec<u8>> {
        let ptr = self.mapped_range(offset, len)?;
        let mut out = vec![0; len];
        // SAFETY: as for `write`.
        unsafe { std::ptr::copy_nonoverlapping(ptr.as_ptr(), out.as_mut_ptr(), len) };
        Ok(out)
    }

    /// A sequential writer over `len` bytes at `offset`.
    pub fn writer(&self, offset: u32, len: usize) -> Result<BufWrite<'_>> {
        let ptr = self.mapped_range(offset, len)?;
        // SAFETY: the mapping outlives the borrow of `self`, and `unmap`
        // needs `&mut self`.
        Ok(unsafe { BufWrite::new(ptr, len) })
    }
}

impl Clone for Bo {
    fn clone(&self) -> Self {
        Self::from_inner(Arc::clone(&self.inner))
    }
}

impl Drop for Bo {
    fn drop(&mut self) {
        // SAFETY: `inner` is never used after this.
        let inner = unsafe { ManuallyDrop::take(&mut self.inner) };
        // Only the last reference gets the buffer back. Once the count is
        // zero the table's weak entries cannot be upgraded any more.
        if let Some(inner) = Arc::into_inner(inner) {
            inner.teardown();
        }
    }
}

impl std::fmt::Debug for Bo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bo")
            .field("handle", &self.inner.handle)
            .field("size", &self.inner.size)
            .field("state", &*self.inner.state())
            .finish()
    }
}
