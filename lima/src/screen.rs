// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The per-device state shared by every context.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

use bitflags::bitflags;

use crate::bo::{Bo, BoInner, ExternalHandle};
use crate::context::Context;
use crate::kernel::{GpuInfo, Kernel};
use crate::va::VaAllocator;
use crate::{Error, Result};

bitflags! {
    /// Debugging aids, normally taken from the `LIMA_DEBUG` environment variable.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DebugFlags: u32 {
        /// Log every flushed command stream.
        const DUMP = 0x01;
        /// Wait for both pipes to finish after every flush.
        const SYNC = 0x02;
    }
}

/// Options which are set at screen creation time, used in [`Screen::new`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScreenOptions {
    pub debug: DebugFlags,

    /// How many PLB slots each context rotates through, 1 to 4.
    ///
    /// More slots let the GP bin the next frame while the PP still reads the
    /// previous one.
    pub plb_slots: u32,
}

impl ScreenOptions {
    pub const MAX_PLB_SLOTS: u32 = 4;

    /// Reads `LIMA_DEBUG` and `LIMA_CTX_NUM_PLB`, falling back to the default
    /// for anything unset or invalid.
    pub fn from_env() -> Self {
        Self::parse(
            std::env::var("LIMA_DEBUG").ok().as_deref(),
            std::env::var("LIMA_CTX_NUM_PLB").ok().as_deref(),
        )
    }

    fn parse(debug: Option<&str>, plb_slots: Option<&str>) -> Self {
        let mut options = Self::default();
        for flag in debug.into_iter().flat_map(|s| s.split(',')) {
            match flag.trim() {
                "" => {}
                "dump" => options.debug |= DebugFlags::DUMP,
                "sync" => options.debug |= DebugFlags::SYNC,
                other => log::warn!("LIMA_DEBUG: ignoring unknown flag {other:?}"),
            }
        }
        if let Some(value) = plb_slots {
            match value.trim().parse::<u32>() {
                Ok(n) if (1..=Self::MAX_PLB_SLOTS).contains(&n) => options.plb_slots = n,
                _ => log::warn!(
                    "LIMA_CTX_NUM_PLB: {value:?} is not in 1..={}, using {}",
                    Self::MAX_PLB_SLOTS,
                    options.plb_slots
                ),
            }
        }
        options
    }
}

impl Default for ScreenOptions {
    fn default() -> Self {
        Self {
            debug: DebugFlags::empty(),
            plb_slots: 2,
        }
    }
}

/// Weak references to every live buffer object, by kernel handle and by
/// flink name.
#[derive(Default)]
pub(crate) struct BoTable {
    pub handles: HashMap<u32, Weak<BoInner>>,
    pub names: HashMap<u32, Weak<BoInner>>,
}

/// What the table knows about a handle or name.
pub(crate) enum Entry {
    Vacant,
    Live(Bo),
    /// The last reference is gone but the kernel handle is not closed yet.
    Closing,
}

impl BoTable {
    fn entry(map: &HashMap<u32, Weak<BoInner>>, key: u32) -> Entry {
        match map.get(&key) {
            None => Entry::Vacant,
            Some(weak) => weak.upgrade().map_or(Entry::Closing, |inner| {
                Entry::Live(Bo::from_inner(inner))
            }),
        }
    }

    pub fn handle_entry(&self, handle: u32) -> Entry {
        Self::entry(&self.handles, handle)
    }

    pub fn name_entry(&self, name: u32) -> Entry {
        Self::entry(&self.names, name)
    }

    pub fn by_handle(&self, handle: u32) -> Option<Bo> {
        match self.handle_entry(handle) {
            Entry::Live(bo) => Some(bo),
            _ => None,
        }
    }

    /// Drops the entries of a closed buffer. Entries already taken over by a
    /// newer buffer are kept.
    pub fn forget(&mut self, handle: u32, name: Option<u32>) {
        if self.handles.get(&handle).is_some_and(|w| w.strong_count() == 0) {
            self.handles.remove(&handle);
        }
        if let Some(name) = name {
            if self.names.get(&name).is_some_and(|w| w.strong_count() == 0) {
                self.names.remove(&name);
            }
        }
    }
}

pub(crate) struct ScreenInner {
    pub kernel: Arc<dyn Kernel>,
    pub info: GpuInfo,
    pub options: ScreenOptions,
    table: Mutex<BoTable>,
    /// Signalled whenever a torn down buffer leaves the table.
    closed: Condvar,
    va: Mutex<VaAllocator>,
}

impl ScreenInner {
    /// Lock order: the table before the VA allocator.
    pub fn table(&self) -> MutexGuard<'_, BoTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits, releasing `table` meanwhile, until `handle` is no longer held
    /// by a buffer being torn down.
    pub fn wait_closed<'a>(
        &'a self,
        table: MutexGuard<'a, BoTable>,
        handle: u32,
    ) -> MutexGuard<'a, BoTable> {
        self.closed
            .wait_while(table, |table| {
                matches!(table.handle_entry(handle), Entry::Closing)
            })
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes the entries of a buffer whose handle was just closed.
    pub fn forget(&self, handle: u32, name: Option<u32>) {
        self.table().forget(handle, name);
        self.closed.notify_all();
    }

    pub fn va(&self) -> MutexGuard<'_, VaAllocator> {
        self.va.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A connection to the GPU.
///
/// Owns the kernel interface, the GPU virtual address space and the table of
/// buffer objects. Cloning is cheap and every clone refers to the same state;
/// all methods take `&self` and can be called from multiple threads.
#[derive(Clone)]
pub struct Screen(pub(crate) Arc<ScreenInner>);

impl Screen {
    pub fn new(kernel: Arc<dyn Kernel>, options: ScreenOptions) -> Result<Self> {
        let info = kernel.query_info()?;
        if !(1..=lima_encoding::MAX_PP as u32).contains(&info.num_pp) {
            return Err(Error::KernelRejected(nix::errno::Errno::ENODEV));
        }
        log::info!(
            "lima: {} with {} PP, VA {:#x}..{:#x}",
            info.gpu_id,
            info.num_pp,
            info.va_start,
            info.va_end
        );
        let va = VaAllocator::new(u64::from(info.va_start), u64::from(info.va_end));
        Ok(Self(Arc::new(ScreenInner {
            kernel,
            info,
            options,
            table: Mutex::default(),
            closed: Condvar::new(),
            va: Mutex::new(va),
        })))
    }

    pub fn info(&self) -> &GpuInfo {
        &self.0.info
    }

    pub fn options(&self) -> &ScreenOptions {
        &self.0.options
    }

    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.0.kernel
    }

    /// Creates a buffer object of at least `size` bytes, with neither a CPU
    /// mapping nor a GPU address.
    pub fn bo_create(&self, size: u32, flags: u32) -> Result<Bo> {
        Bo::create(&self.0, size, flags)
    }

    /// Imports a buffer shared by another process or API, returning the
    /// existing [`Bo`] when this screen already knows it.
    pub fn bo_import(&self, handle: ExternalHandle) -> Result<Bo> {
        Bo::import(&self.0, handle)
    }

    /// Like [`Screen::bo_import`], but fails if the buffer is smaller than
    /// `expected` bytes.
    pub fn bo_import_with_size(&self, handle: ExternalHandle, expected: u64) -> Result<Bo> {
        let bo = self.bo_import(handle)?;
        let actual = u64::from(bo.size());
        if actual < expected {
            return Err(Error::ProtocolMismatch { expected, actual });
        }
        Ok(bo)
    }

    pub fn create_context(&self) -> Result<Context> {
        Context::new(self.clone())
    }

    /// Number of buffer objects alive on this screen.
    pub fn bo_count(&self) -> usize {
        self.0
            .table()
            .handles
            .values()
            .filter(|bo| bo.strong_count() > 0)
            .count()
    }

    /// Unallocated bytes of GPU virtual address space.
    pub fn va_free_bytes(&self) -> u64 {
        self.0.va().free_bytes()
    }
}

impl std::fmt::Debug for Screen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Screen")
            .field("info", &self.0.info)
            .field("options", &self.0.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::{DebugFlags, ScreenOptions};

    #[test]
    fn options_default_without_environment() {
        let options = ScreenOptions::parse(None, None);
        assert_eq!(options, ScreenOptions::default());
        assert_eq!(options.plb_slots, 2);
    }

    #[test]
    fn debug_flags_parse() {
        let options = ScreenOptions::parse(Some("dump, sync,bogus"), None);
        assert_eq!(options.debug, DebugFlags::DUMP | DebugFlags::SYNC);
    }

    #[test]
    fn plb_slots_out_of_range_are_ignored() {
        assert_eq!(ScreenOptions::parse(None, Some("3")).plb_slots, 3);
        assert_eq!(ScreenOptions::parse(None, Some("0")).plb_slots, 2);
        assert_eq!(ScreenOptions::parse(None, Some("5")).plb_slots, 2);
        assert_eq!(ScreenOptions::parse(None, Some("many")).plb_slots, 2);
    }
}
