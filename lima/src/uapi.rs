// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Wire layouts of the DRM and lima ioctls.
//!
//! These must be kept in sync with `drm.h` and `lima_drm.h`.

#![allow(non_camel_case_types)]

use bytemuck::{Pod, Zeroable};

pub(crate) const DRM_IOCTL_BASE: u8 = b'd';
pub(crate) const DRM_COMMAND_BASE: u8 = 0x40;

pub(crate) const DRM_GEM_CLOSE: u8 = 0x09;
pub(crate) const DRM_GEM_FLINK: u8 = 0x0a;
pub(crate) const DRM_GEM_OPEN: u8 = 0x0b;
pub(crate) const DRM_PRIME_HANDLE_TO_FD: u8 = 0x2d;
pub(crate) const DRM_PRIME_FD_TO_HANDLE: u8 = 0x2e;

pub(crate) const DRM_LIMA_INFO: u8 = 0x00;
pub(crate) const DRM_LIMA_GEM_CREATE: u8 = 0x01;
pub(crate) const DRM_LIMA_GEM_INFO: u8 = 0x02;
pub(crate) const DRM_LIMA_GEM_VA: u8 = 0x03;
pub(crate) const DRM_LIMA_GEM_SUBMIT: u8 = 0x04;
pub(crate) const DRM_LIMA_WAIT_FENCE: u8 = 0x05;
pub(crate) const DRM_LIMA_GEM_WAIT: u8 = 0x06;
pub(crate) const DRM_LIMA_CTX: u8 = 0x07;

pub(crate) const LIMA_INFO_GPU_MALI400: u32 = 0x00;
pub(crate) const LIMA_INFO_GPU_MALI450: u32 = 0x01;

pub(crate) const LIMA_VA_OP_MAP: u32 = 1;
pub(crate) const LIMA_VA_OP_UNMAP: u32 = 2;

pub(crate) const LIMA_CTX_OP_CREATE: u32 = 1;
pub(crate) const LIMA_CTX_OP_FREE: u32 = 2;

pub(crate) const DRM_CLOEXEC: u32 = 0o2000000;
pub(crate) const DRM_RDWR: u32 = 0o2;

#[derive(Clone, Copy, Default, Zeroable, Pod)]
#[repr(C)]
pub(crate) struct drm_gem_close {
    pub handle: u32,
    pub pad: u32,
}

#[derive(Clone, Copy, Default, Zeroable, Pod)]
#[repr(C)]
pub(crate) struct drm_gem_flink {
    pub handle: u32,
    pub name: u32,
}

#[derive(Clone, Copy, Default, Zeroable, Pod)]
#[repr(C)]
pub(crate) struct drm_gem_open {
    pub name: u32,
    pub handle: u32,
    pub size: u64,
}

#[derive(Clone, Copy, Default, Zeroable, Pod)]
#[repr(C)]
pub(crate) struct drm_prime_handle {
    pub handle: u32,
    pub flags: u32,
    pub fd: i32,
}

#[derive(Clone, Copy, Default, Zeroable, Pod)]
#[repr(C)]
pub(crate) struct drm_lima_info {
    pub gpu_id: u32,
    pub num_pp: u32,
    pub va_start: u32,
    pub va_end: u32,
    pub _resv: [u32; 4],
}

#[derive(Clone, Copy, Default, Zeroable, Pod)]
#[repr(C)]
pub(crate) struct drm_lima_gem_create {
    pub size: u32,
    pub flags: u32,
    pub handle: u32,
    pub pad: u32,
}

#[derive(Clone, Copy, Default, Zeroable, Pod)]
#[repr(C)]
pub(crate) struct drm_lima_gem_info {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
}

#[derive(Clone, Copy, Default, Zeroable, Pod)]
#[repr(C)]
pub(crate) struct drm_lima_gem_va {
    pub handle: u32,
    pub op: u32,
    pub flags: u32,
    pub va: u32,
}

#[derive(Clone, Copy, Default, Zeroable, Pod)]
#[repr(C)]
pub(crate) struct drm_lima_gem_submit_bo {
    pub handle: u32,
    pub flags: u32,
}

pub(crate) const LIMA_SUBMIT_FLAG_SYNC_FD_OUT: u32 = 0x01;

#[derive(Clone, Copy, Default, Zeroable, Pod)]
#[repr(C)]
pub(crate) struct drm_lima_gem_submit_in {
    pub ctx: u32,
    pub pipe: u32,
    pub nr_bos: u32,
    pub frame_size: u32,
    pub bos: u64,
    pub frame: u64,
    pub flags: u32,
    pub pad: u32,
}

#[derive(Clone, Copy, Default, Zeroable, Pod)]
#[repr(C)]
pub(crate) struct drm_lima_gem_submit_out {
    pub fence: u32,
    pub done: u32,
    pub sync_fd: i32,
    pub _resv: [u32; 7],
}

/// The submit ioctl reads its arguments from and writes its results to the
/// same memory.
#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) union drm_lima_gem_submit {
    pub in_: drm_lima_gem_submit_in,
    pub out: drm_lima_gem_submit_out,
}

#[derive(Clone, Copy, Default, Zeroable, Pod)]
#[repr(C)]
pub(crate) struct drm_lima_wait_fence {
    pub pipe: u32,
    pub seq: u32,
    pub timeout_ns: u64,
    pub ctx: u32,
    pub pad: u32,
}

#[derive(Clone, Copy, Default, Zeroable, Pod)]
#[repr(C)]
pub(crate) struct drm_lima_gem_wait {
    pub handle: u32,
    pub op: u32,
    pub timeout_ns: u64,
}

#[derive(Clone, Copy, Default, Zeroable, Pod)]
#[repr(C)]
pub(crate) struct drm_lima_ctx {
    pub op: u32,
    pub id: u32,
}

static_assertions::assert_eq_size!(drm_lima_gem_submit_in, drm_lima_gem_submit_out);
static_assertions::const_assert_eq!(std::mem::size_of::<drm_lima_gem_submit>(), 40);
static_assertions::const_assert_eq!(std::mem::size_of::<drm_lima_wait_fence>(), 24);
