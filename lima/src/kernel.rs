// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The interface to the kernel driver.
//!
//! [`Kernel`] mirrors the lima ioctl surface one method per request, with
//! plain request and response types in place of the wire structs. The wire
//! layouts only exist at the ioctl call site in [`crate::drm`].

use std::fmt;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::ptr::NonNull;

use bitflags::bitflags;
use nix::errno::Errno;
use nix::time::{clock_gettime, ClockId};

pub type KernelResult<T> = std::result::Result<T, Errno>;

/// A deadline which is never reached.
pub const NO_DEADLINE: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GpuId {
    Mali400,
    Mali450,
}

impl fmt::Display for GpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mali400 => f.write_str("Mali400"),
            Self::Mali450 => f.write_str("Mali450"),
        }
    }
}

/// Static properties of the GPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuInfo {
    pub gpu_id: GpuId,
    /// Number of pixel processors, 1 to 4.
    pub num_pp: u32,
    /// GPU virtual address window available to user space, `[va_start, va_end)`.
    pub va_start: u32,
    pub va_end: u32,
}

impl GpuInfo {
    /// Start of the user VA window; the first megabyte stays unmapped.
    pub const DEFAULT_VA_START: u32 = 0x0010_0000;
    /// End of the user VA window; the kernel reserves the top megabyte.
    pub const DEFAULT_VA_END: u32 = 0xFFF0_0000;
}

/// An execution pipe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Pipe {
    /// The geometry processor.
    Gp = 0,
    /// The pixel processors.
    Pp = 1,
}

impl Pipe {
    pub const ALL: [Self; 2] = [Self::Gp, Self::Pp];

    pub fn index(self) -> usize {
        self as usize
    }
}

bitflags! {
    /// How a job or a CPU wait accesses a buffer.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BoAccess: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SubmitFlags: u32 {
        /// Return a sync file descriptor signalled when the job completes.
        const SYNC_FD_OUT = 0x01;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VaOp {
    Map,
    Unmap,
}

/// A kernel buffer object as returned by create and open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GemObject {
    pub handle: u32,
    /// Size in bytes, rounded up by the kernel.
    pub size: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubmitBo {
    pub handle: u32,
    pub access: BoAccess,
}

#[derive(Clone, Copy, Debug)]
pub struct SubmitRequest<'a> {
    pub ctx: u32,
    pub pipe: Pipe,
    pub bos: &'a [SubmitBo],
    /// The frame descriptor of the pipe.
    pub frame: &'a [u8],
    pub flags: SubmitFlags,
}

#[derive(Debug)]
pub struct SubmitResponse {
    /// Sequence number of the job on its pipe.
    pub fence: u32,
    /// Present when [`SubmitFlags::SYNC_FD_OUT`] was requested.
    pub sync_fd: Option<OwnedFd>,
}

/// The lima kernel driver interface.
///
/// Deadlines are absolute `CLOCK_MONOTONIC` times in nanoseconds, as
/// produced by [`absolute_timeout`].
pub trait Kernel: Send + Sync + fmt::Debug {
    fn query_info(&self) -> KernelResult<GpuInfo>;

    fn gem_create(&self, size: u32, flags: u32) -> KernelResult<GemObject>;

    /// Returns the offset to pass to [`Kernel::mmap`] for `handle`.
    fn gem_info(&self, handle: u32) -> KernelResult<u64>;

    fn gem_close(&self, handle: u32) -> KernelResult<()>;

    fn gem_flink(&self, handle: u32) -> KernelResult<u32>;

    fn gem_open(&self, name: u32) -> KernelResult<GemObject>;

    fn prime_fd_to_handle(&self, fd: BorrowedFd<'_>) -> KernelResult<u32>;

    fn prime_handle_to_fd(&self, handle: u32) -> KernelResult<OwnedFd>;

    /// Maps `size` bytes of a buffer into the CPU address space.
    ///
    /// # Safety
    ///
    /// `offset` must come from [`Kernel::gem_info`] for a live handle, and
    /// the mapping must be released with [`Kernel::munmap`] before the handle
    /// is closed.
    unsafe fn mmap(&self, offset: u64, size: usize) -> KernelResult<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` and `size` must describe a mapping returned by [`Kernel::mmap`],
    /// and no reference into it may outlive this call.
    unsafe fn munmap(&self, ptr: NonNull<u8>, size: usize) -> KernelResult<()>;

    fn gem_va(&self, handle: u32, op: VaOp, va: u32) -> KernelResult<()>;

    fn gem_submit(&self, request: &SubmitRequest<'_>) -> KernelResult<SubmitResponse>;

    fn wait_fence(&self, ctx: u32, pipe: Pipe, seq: u32, deadline: u64) -> KernelResult<()>;

    fn gem_wait(&self, handle: u32, access: BoAccess, deadline: u64) -> KernelResult<()>;

    /// Returns a sync file descriptor that becomes readable once `seq` on
    /// `pipe` has completed.
    fn fence_export(&self, ctx: u32, pipe: Pipe, seq: u32) -> KernelResult<OwnedFd>;

    fn ctx_create(&self) -> KernelResult<u32>;

    fn ctx_free(&self, ctx: u32) -> KernelResult<()>;
}

/// Converts a timeout in nanoseconds to an absolute monotonic deadline.
///
/// Relative timeouts are offset by the current clock, so this must be called
/// immediately before the blocking call it is for.
pub fn absolute_timeout(timeout_ns: u64, relative: bool) -> KernelResult<u64> {
    if !relative || timeout_ns == NO_DEADLINE {
        return Ok(timeout_ns);
    }
    let now = clock_gettime(ClockId::CLOCK_MONOTONIC)?;
    let now_ns = (now.tv_sec() as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(now.tv_nsec() as u64);
    Ok(now_ns.saturating_add(timeout_ns))
}
