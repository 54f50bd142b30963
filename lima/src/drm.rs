// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The kernel interface backed by a lima DRM device node.

use std::ffi::c_void;
use std::fs::OpenOptions;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

use crate::kernel::{
    BoAccess, GemObject, GpuId, GpuInfo, Kernel, KernelResult, Pipe, SubmitFlags, SubmitRequest,
    SubmitResponse, VaOp,
};
use crate::uapi::*;

ioctl_write_ptr!(drm_ioctl_gem_close, DRM_IOCTL_BASE, DRM_GEM_CLOSE, drm_gem_close);
ioctl_readwrite!(drm_ioctl_gem_flink, DRM_IOCTL_BASE, DRM_GEM_FLINK, drm_gem_flink);
ioctl_readwrite!(drm_ioctl_gem_open, DRM_IOCTL_BASE, DRM_GEM_OPEN, drm_gem_open);
ioctl_readwrite!(
    drm_ioctl_prime_handle_to_fd,
    DRM_IOCTL_BASE,
    DRM_PRIME_HANDLE_TO_FD,
    drm_prime_handle
);
ioctl_readwrite!(
    drm_ioctl_prime_fd_to_handle,
    DRM_IOCTL_BASE,
    DRM_PRIME_FD_TO_HANDLE,
    drm_prime_handle
);

ioctl_read!(
    drm_ioctl_lima_info,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_LIMA_INFO,
    drm_lima_info
);
ioctl_readwrite!(
    drm_ioctl_lima_gem_create,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_LIMA_GEM_CREATE,
    drm_lima_gem_create
);
ioctl_readwrite!(
    drm_ioctl_lima_gem_info,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_LIMA_GEM_INFO,
    drm_lima_gem_info
);
ioctl_write_ptr!(
    drm_ioctl_lima_gem_va,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_LIMA_GEM_VA,
    drm_lima_gem_va
);
ioctl_readwrite!(
    drm_ioctl_lima_gem_submit,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_LIMA_GEM_SUBMIT,
    drm_lima_gem_submit
);
ioctl_write_ptr!(
    drm_ioctl_lima_wait_fence,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_LIMA_WAIT_FENCE,
    drm_lima_wait_fence
);
ioctl_write_ptr!(
    drm_ioctl_lima_gem_wait,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_LIMA_GEM_WAIT,
    drm_lima_gem_wait
);
ioctl_readwrite!(
    drm_ioctl_lima_ctx,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + DRM_LIMA_CTX,
    drm_lima_ctx
);

/// Runs an ioctl, restarting it when interrupted by a signal.
fn ioctl_retry(mut f: impl FnMut() -> nix::Result<i32>) -> KernelResult<()> {
    loop {
        match f() {
            Err(Errno::EINTR | Errno::EAGAIN) => continue,
            Err(errno) => return Err(errno),
            Ok(_) => return Ok(()),
        }
    }
}

/// A lima device node.
#[derive(Debug)]
pub struct DrmKernel {
    fd: OwnedFd,
}

impl DrmKernel {
    /// Opens a device node such as `/dev/dri/renderD128`.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlag::O_CLOEXEC.bits())
            .open(path)?;
        Ok(Self::from_fd(file.into()))
    }

    /// Wraps an already open device node.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl AsFd for DrmKernel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Kernel for DrmKernel {
    fn query_info(&self) -> KernelResult<GpuInfo> {
        let mut req = drm_lima_info::default();
        // SAFETY: This is a well-formed ioctl conforming to the driver specification.
        ioctl_retry(|| unsafe { drm_ioctl_lima_info(self.fd.as_raw_fd(), &mut req) })?;
        let gpu_id = match req.gpu_id {
            LIMA_INFO_GPU_MALI400 => GpuId::Mali400,
            LIMA_INFO_GPU_MALI450 => GpuId::Mali450,
            _ => return Err(Errno::ENODEV),
        };
        let (va_start, va_end) = if req.va_end > req.va_start {
            (req.va_start, req.va_end)
        } else {
            (GpuInfo::DEFAULT_VA_START, GpuInfo::DEFAULT_VA_END)
        };
        Ok(GpuInfo {
            gpu_id,
            num_pp: req.num_pp,
            va_start,
            va_end,
        })
    }

    fn gem_create(&self, size: u32, flags: u32) -> KernelResult<GemObject> {
        let mut req = drm_lima_gem_create {
            size,
            flags,
            ..Default::default()
        };
        // SAFETY: This is a well-formed ioctl conforming to the driver specification.
        ioctl_retry(|| unsafe { drm_ioctl_lima_gem_create(self.fd.as_raw_fd(), &mut req) })?;
        Ok(GemObject {
            handle: req.handle,
            size: req.size,
        })
    }

    fn gem_info(&self, handle: u32) -> KernelResult<u64> {
        let mut req = drm_lima_gem_info {
            handle,
            ..Default::default()
        };
        // SAFETY: This is a well-formed ioctl conforming to the driver specification.
        ioctl_retry(|| unsafe { drm_ioctl_lima_gem_info(self.fd.as_raw_fd(), &mut req) })?;
        Ok(req.offset)
    }

    fn gem_close(&self, handle: u32) -> KernelResult<()> {
        let req = drm_gem_close { handle, pad: 0 };
        // SAFETY: This is a well-formed ioctl conforming to the driver specification.
        ioctl_retry(|| unsafe { drm_ioctl_gem_close(self.fd.as_raw_fd(), &req) })
    }

    fn gem_flink(&self, handle: u32) -> KernelResult<u32> {
        let mut req = drm_gem_flink { handle, name: 0 };
        // SAFETY: This is a well-formed ioctl conforming to the driver specification.
        ioctl_retry(|| unsafe { drm_ioctl_gem_flink(self.fd.as_raw_fd(), &mut req) })?;
        Ok(req.name)
    }

    fn gem_open(&self, name: u32) -> KernelResult<GemObject> {
        let mut req = drm_gem_open {
            name,
            ..Default::default()
        };
        // SAFETY: This is a well-formed ioctl conforming to the driver specification.
        ioctl_retry(|| unsafe { drm_ioctl_gem_open(self.fd.as_raw_fd(), &mut req) })?;
        Ok(GemObject {
            handle: req.handle,
            size: u32::try_from(req.size).map_err(|_| Errno::EOVERFLOW)?,
        })
    }

    fn prime_fd_to_handle(&self, fd: BorrowedFd<'_>) -> KernelResult<u32> {
        let mut req = drm_prime_handle {
            fd: fd.as_raw_fd(),
            ..Default::default()
        };
        // SAFETY: This is a well-formed ioctl conforming to the driver specification.
        // The kernel only borrows `fd`.
        ioctl_retry(|| unsafe { drm_ioctl_prime_fd_to_handle(self.fd.as_raw_fd(), &mut req) })?;
        Ok(req.handle)
    }

    fn prime_handle_to_fd(&self, handle: u32) -> KernelResult<OwnedFd> {
        let mut req = drm_prime_handle {
            handle,
            flags: DRM_CLOEXEC | DRM_RDWR,
            fd: -1,
        };
        // SAFETY: This is a well-formed ioctl conforming to the driver specification.
        ioctl_retry(|| unsafe { drm_ioctl_prime_handle_to_fd(self.fd.as_raw_fd(), &mut req) })?;
        // SAFETY: the kernel just installed this descriptor for us and it is
        // recorded nowhere else.
        Ok(unsafe { OwnedFd::from_raw_fd(req.fd) })
    }

    unsafe fn mmap(&self, offset: u64, size: usize) -> KernelResult<NonNull<u8>> {
        let length = NonZeroUsize::new(size).ok_or(Errno::EINVAL)?;
        let offset = i64::try_from(offset).map_err(|_| Errno::EOVERFLOW)?;
        // SAFETY: the caller guarantees `offset` names a live buffer, which
        // the kernel bounds-checks against `length`.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &self.fd,
                offset as _,
            )?
        };
        Ok(ptr.cast())
    }

    unsafe fn munmap(&self, ptr: NonNull<u8>, size: usize) -> KernelResult<()> {
        // SAFETY: the caller guarantees this is a mapping we created.
        unsafe { munmap(ptr.cast::<c_void>(), size) }
    }

    fn gem_va(&self, handle: u32, op: VaOp, va: u32) -> KernelResult<()> {
        let req = drm_lima_gem_va {
            handle,
            op: match op {
                VaOp::Map => LIMA_VA_OP_MAP,
                VaOp::Unmap => LIMA_VA_OP_UNMAP,
            },
            flags: 0,
            va,
        };
        // SAFETY: This is a well-formed ioctl conforming to the driver specification.
        ioctl_retry(|| unsafe { drm_ioctl_lima_gem_va(self.fd.as_raw_fd(), &req) })
    }

    fn gem_submit(&self, request: &SubmitRequest<'_>) -> KernelResult<SubmitResponse> {
        let bos: Vec<drm_lima_gem_submit_bo> = request
            .bos
            .iter()
            .map(|bo| drm_lima_gem_submit_bo {
                handle: bo.handle,
                flags: bo.access.bits(),
            })
            .collect();
        let mut flags = 0;
        if request.flags.contains(SubmitFlags::SYNC_FD_OUT) {
            flags |= LIMA_SUBMIT_FLAG_SYNC_FD_OUT;
        }
        let mut req = drm_lima_gem_submit {
            in_: drm_lima_gem_submit_in {
                ctx: request.ctx,
                pipe: request.pipe as u32,
                nr_bos: bos.len() as u32,
                frame_size: request.frame.len() as u32,
                bos: bos.as_ptr() as u64,
                frame: request.frame.as_ptr() as u64,
                flags,
                pad: 0,
            },
        };
        // SAFETY: This is a well-formed ioctl conforming to the driver
        // specification. `bos` and `frame` outlive the call and the kernel
        // does not retain the pointers.
        ioctl_retry(|| unsafe { drm_ioctl_lima_gem_submit(self.fd.as_raw_fd(), &mut req) })?;
        // SAFETY: on success the kernel has overwritten the union with `out`.
        let out = unsafe { req.out };
        let sync_fd = (flags & LIMA_SUBMIT_FLAG_SYNC_FD_OUT != 0 && out.sync_fd >= 0).then(|| {
            // SAFETY: the kernel installed this descriptor for us.
            unsafe { OwnedFd::from_raw_fd(out.sync_fd) }
        });
        Ok(SubmitResponse {
            fence: out.fence,
            sync_fd,
        })
    }

    fn wait_fence(&self, ctx: u32, pipe: Pipe, seq: u32, deadline: u64) -> KernelResult<()> {
        let req = drm_lima_wait_fence {
            pipe: pipe as u32,
            seq,
            timeout_ns: deadline,
            ctx,
            pad: 0,
        };
        // SAFETY: This is a well-formed ioctl conforming to the driver specification.
        ioctl_retry(|| unsafe { drm_ioctl_lima_wait_fence(self.fd.as_raw_fd(), &req) })
    }

    fn gem_wait(&self, handle: u32, access: BoAccess, deadline: u64) -> KernelResult<()> {
        let req = drm_lima_gem_wait {
            handle,
            op: access.bits(),
            timeout_ns: deadline,
        };
        // SAFETY: This is a well-formed ioctl conforming to the driver specification.
        ioctl_retry(|| unsafe { drm_ioctl_lima_gem_wait(self.fd.as_raw_fd(), &req) })
    }

    /// The lima uapi cannot turn an already submitted job into a sync file;
    /// jobs that need one request [`SubmitFlags::SYNC_FD_OUT`] at submission.
    fn fence_export(&self, _ctx: u32, _pipe: Pipe, _seq: u32) -> KernelResult<OwnedFd> {
        Err(Errno::EOPNOTSUPP)
    }

    fn ctx_create(&self) -> KernelResult<u32> {
        let mut req = drm_lima_ctx {
            op: LIMA_CTX_OP_CREATE,
            id: 0,
        };
        // SAFETY: This is a well-formed ioctl conforming to the driver specification.
        ioctl_retry(|| unsafe { drm_ioctl_lima_ctx(self.fd.as_raw_fd(), &mut req) })?;
        Ok(req.id)
    }

    fn ctx_free(&self, ctx: u32) -> KernelResult<()> {
        let mut req = drm_lima_ctx {
            op: LIMA_CTX_OP_FREE,
            id: ctx,
        };
        // SAFETY: This is a well-formed ioctl conforming to the driver specification.
        ioctl_retry(|| unsafe { drm_ioctl_lima_ctx(self.fd.as_raw_fd(), &mut req) })
    }
}
