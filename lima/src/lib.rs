// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Lima is the buffer, submission and fence core of a driver for ARM
//! Mali-4xx GPUs.
//!
//! A [`Screen`] owns the connection to the kernel driver, the GPU virtual
//! address space and the table of buffer objects. Buffer objects ([`Bo`]) are
//! reference counted handles to GPU-visible memory; the last handle to go
//! away unmaps the buffer from the GPU and releases it to the kernel.
//!
//! Rendering happens through a [`Context`], which owns one [`SubmitQueue`]
//! per execution pipe, a cache of per-geometry tile streams ([`PlbCache`]),
//! and the [`CommandPacker`] which accumulates draws until they are flushed
//! as a GP job and a PP job. Each submission yields a [`Fence`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use lima::{drm::DrmKernel, Screen, ScreenOptions};
//!
//! # fn main() -> lima::Result<()> {
//! let kernel = DrmKernel::open("/dev/dri/renderD128")?;
//! let screen = Screen::new(Arc::new(kernel), ScreenOptions::from_env())?;
//! let bo = screen.bo_create(4096, 0)?;
//! bo.update(true, true)?;
//! # Ok(())
//! # }
//! ```
//!
//! The [`sim`] module provides a software model of the kernel driver, which
//! is what the tests run against.

// LINEBENDER LINT SET - lib.rs - v2
// See https://linebender.org/wiki/canonical-lints/
// These lints aren't included in Cargo.toml because they
// shouldn't apply to examples and tests
#![warn(unused_crate_dependencies)]
#![warn(clippy::print_stdout, clippy::print_stderr)]
// Targeting e.g. 32-bit means structs containing usize can give false positives for 64-bit.
#![cfg_attr(target_pointer_width = "64", warn(clippy::trivially_copy_pass_by_ref))]
// END LINEBENDER LINT SET
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod bo;
mod bufwrite;
mod context;
pub mod drm;
mod dump;
mod fence;
pub mod kernel;
mod packer;
mod plb;
mod scratch;
mod screen;
pub mod sim;
mod submit;
mod uapi;
mod va;

use thiserror::Error;

pub use nix::errno::Errno;

pub use bo::{Bo, ExternalHandle, HandleKind};
pub use bufwrite::BufWrite;
pub use context::{ClearFlags, ColorTarget, Context, FlushFences, Surface};
pub use fence::Fence;
pub use kernel::{BoAccess, GpuId, GpuInfo, Kernel, Pipe};
pub use packer::{
    CommandPacker, DrawInfo, DrawState, FragmentShader, IndexBuffer, Rasterizer, Scissor,
    VertexAttrib, VertexShader, Viewport,
};
pub use plb::{PlbCache, PlbKey, PlbStreamEntry};
pub use scratch::{ScratchAlloc, ScratchRole};
pub use screen::{DebugFlags, Screen, ScreenOptions};
pub use submit::SubmitQueue;
pub use va::{VaAllocator, PAGE_SIZE};

/// Errors that can occur in Lima.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The kernel driver returned an error for an ioctl or mapping request.
    #[error("Kernel rejected request: {0}")]
    KernelRejected(#[from] Errno),
    /// No hole in the GPU virtual address space is large enough.
    #[error("Out of GPU virtual address space")]
    OutOfVaSpace,
    /// The kernel refused to allocate buffer memory.
    #[error("Kernel failed to allocate buffer: {0}")]
    AllocationFailed(Errno),
    /// A fence or buffer wait passed its deadline.
    #[error("Timed out waiting for the GPU")]
    Timeout,
    /// An imported handle does not refer to a known buffer.
    #[error("Unknown buffer handle {0}")]
    InvalidHandle(u32),
    /// An imported buffer is smaller than the importer requires.
    #[error("Imported buffer is {actual} bytes, expected at least {expected}")]
    ProtocolMismatch { expected: u64, actual: u64 },
    /// A range was freed or accessed that was never allocated.
    #[error("Invalid range {offset:#x}+{size:#x}")]
    InvalidRange { offset: u64, size: u64 },
    /// The context which owned a native fence no longer exists.
    #[error("Fence belongs to a destroyed context")]
    ContextLost,
    /// The kernel driver does not support the requested operation.
    #[error("Operation not supported by the kernel driver")]
    Unsupported,
    /// A draw or flush was issued without a framebuffer.
    #[error("No framebuffer is bound")]
    NoFramebuffer,
    /// A surface geometry was used without being registered in this context.
    #[error("Surface geometry {tiled_w}x{tiled_h} tiles is not registered")]
    UnregisteredGeometry { tiled_w: u32, tiled_h: u32 },
}

impl Error {
    /// Classifies the error of a blocking wait, keeping expired deadlines
    /// apart from real failures.
    pub(crate) fn from_wait(errno: Errno) -> Self {
        match errno {
            Errno::ETIMEDOUT | Errno::ETIME | Errno::EBUSY => Self::Timeout,
            errno => Self::KernelRejected(errno),
        }
    }

    /// Whether waiting again later may succeed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::KernelRejected(
            err.raw_os_error()
                .map(Errno::from_raw)
                .unwrap_or(Errno::EIO),
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
