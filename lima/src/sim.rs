// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A software model of the lima kernel driver.
//!
//! [`SimKernel`] implements [`Kernel`] entirely in process: buffer storage is
//! host memory, flink names and dma-bufs are tracked in tables, and jobs
//! complete as soon as they are submitted unless a pipe is held with
//! [`SimKernel::hold`]. The model never blocks; a wait on unfinished work
//! reports a timeout immediately.
//!
//! Every submission is recorded, and [`SimKernel::read_va`] reads memory
//! through the GPU address space, so tests can follow the addresses in a frame
//! descriptor to the command streams it points at.

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::os::unix::fs::MetadataExt;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lima_encoding::{GpFrame, PpFrame};
use nix::errno::Errno;
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};

use crate::kernel::{
    BoAccess, GemObject, GpuId, GpuInfo, Kernel, KernelResult, Pipe, SubmitBo, SubmitFlags,
    SubmitRequest, SubmitResponse, VaOp,
};

/// Largest buffer the model agrees to allocate.
const MAX_OBJECT_SIZE: u32 = 256 << 20;
const PAGE_SHIFT: u32 = 12;

/// Operations of the model which can be made to fail with
/// [`SimKernel::inject_fault`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimOp {
    GemCreate,
    GemInfo,
    GemOpen,
    GemFlink,
    PrimeExport,
    PrimeImport,
    Mmap,
    GemVa,
    GemSubmit,
    WaitFence,
    GemWait,
    CtxCreate,
}

/// A job as the model received it.
#[derive(Clone, Debug)]
pub struct SimSubmission {
    pub ctx: u32,
    pub pipe: Pipe,
    pub seq: u32,
    pub bos: Vec<SubmitBo>,
    pub frame: Vec<u8>,
}

impl SimSubmission {
    /// The frame descriptor of a GP job.
    pub fn gp_frame(&self) -> Option<GpFrame> {
        (self.pipe == Pipe::Gp)
            .then(|| bytemuck::try_pod_read_unaligned(&self.frame).ok())
            .flatten()
    }

    /// The frame descriptor of a PP job.
    pub fn pp_frame(&self) -> Option<PpFrame> {
        (self.pipe == Pipe::Pp)
            .then(|| bytemuck::try_pod_read_unaligned(&self.frame).ok())
            .flatten()
    }

    /// The access the job declared for `handle`, if it referenced it.
    pub fn access(&self, handle: u32) -> Option<BoAccess> {
        self.bos
            .iter()
            .find(|bo| bo.handle == handle)
            .map(|bo| bo.access)
    }
}

/// Zero-initialised backing storage of one buffer object.
struct SimMemory {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the storage is plain bytes; concurrent access through mappings is
// the client's responsibility, as with real GPU memory.
unsafe impl Send for SimMemory {}
// SAFETY: as above.
unsafe impl Sync for SimMemory {}

impl SimMemory {
    fn new(len: usize) -> Self {
        let storage: Box<[u8]> = vec![0; len].into_boxed_slice();
        let ptr = NonNull::from(Box::leak(storage)).cast::<u8>();
        Self { ptr, len }
    }

    fn read(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        if offset.checked_add(len)? > self.len {
            return None;
        }
        let mut out = vec![0; len];
        // SAFETY: the range was checked against the allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        Some(out)
    }
}

impl Drop for SimMemory {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        // SAFETY: `ptr` came from `Box::leak` of a slice of `len` bytes in `new`.
        drop(unsafe { Box::from_raw(slice) });
    }
}

struct SimObject {
    memory: SimMemory,
    size: u32,
}

#[derive(Default)]
struct SimPipe {
    /// Sequence numbers handed out so far.
    last_seq: u32,
    /// Highest sequence number known complete.
    completed: u32,
    /// Write ends of exported sync files, closed when `seq` completes.
    waiters: Vec<(u32, OwnedFd)>,
}

#[derive(Default)]
struct SimContext {
    pipes: [SimPipe; 2],
}

struct Pending {
    ctx: u32,
    pipe: Pipe,
    seq: u32,
    bos: Vec<SubmitBo>,
}

#[derive(Default)]
struct SimState {
    next_handle: u32,
    next_name: u32,
    next_ctx: u32,
    handles: HashMap<u32, Arc<SimObject>>,
    names: HashMap<u32, Arc<SimObject>>,
    /// Exported dma-bufs by inode, keeping one descriptor open so the inode
    /// stays unique.
    dmabufs: HashMap<u64, (OwnedFd, Arc<SimObject>)>,
    va: HashMap<u32, u32>,
    contexts: HashMap<u32, SimContext>,
    held: [bool; 2],
    pending: Vec<Pending>,
    submissions: Vec<SimSubmission>,
    /// Armed faults and the calls each lets through first.
    faults: HashMap<SimOp, (u32, Errno)>,
    live_mappings: usize,
    mmap_count: usize,
    closed_handles: usize,
}

impl SimState {
    fn take_fault(&mut self, op: SimOp) -> KernelResult<()> {
        let Some((skip, errno)) = self.faults.get(&op).copied() else {
            return Ok(());
        };
        if skip > 0 {
            self.faults.insert(op, (skip - 1, errno));
            return Ok(());
        }
        self.faults.remove(&op);
        Err(errno)
    }

    fn object(&self, handle: u32) -> KernelResult<&Arc<SimObject>> {
        self.handles.get(&handle).ok_or(Errno::ENOENT)
    }

    fn install(&mut self, object: Arc<SimObject>) -> u32 {
        self.next_handle += 1;
        let handle = self.next_handle;
        self.handles.insert(handle, object);
        handle
    }

    fn complete(&mut self, pipe: Pipe, ctx_filter: Option<u32>) {
        let mut finished = Vec::new();
        self.pending.retain(|job| {
            let done = job.pipe == pipe && ctx_filter.map_or(true, |ctx| ctx == job.ctx);
            if done {
                finished.push((job.ctx, job.seq));
            }
            !done
        });
        for (ctx, seq) in finished {
            if let Some(context) = self.contexts.get_mut(&ctx) {
                let state = &mut context.pipes[pipe.index()];
                state.completed = state.completed.max(seq);
                let completed = state.completed;
                // Dropping the write end makes the read end report POLLHUP.
                state.waiters.retain(|(seq, _)| *seq > completed);
            }
        }
    }
}

/// An in-process stand-in for the lima kernel driver.
pub struct SimKernel {
    info: GpuInfo,
    state: Mutex<SimState>,
}

impl std::fmt::Debug for SimKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimKernel").field("info", &self.info).finish()
    }
}

impl SimKernel {
    pub fn new(info: GpuInfo) -> Self {
        Self {
            info,
            state: Mutex::new(SimState::default()),
        }
    }

    /// A Mali-400 with `num_pp` pixel processors and the default VA window.
    pub fn mali400(num_pp: u32) -> Self {
        Self::new(GpuInfo {
            gpu_id: GpuId::Mali400,
            num_pp,
            va_start: GpuInfo::DEFAULT_VA_START,
            va_end: GpuInfo::DEFAULT_VA_END,
        })
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next call of `op` fail with `errno`.
    pub fn inject_fault(&self, op: SimOp, errno: Errno) {
        self.inject_fault_after(op, 0, errno);
    }

    /// Lets `skip` calls of `op` succeed, then makes the next one fail with
    /// `errno`.
    pub fn inject_fault_after(&self, op: SimOp, skip: u32, errno: Errno) {
        self.state().faults.insert(op, (skip, errno));
    }

    /// While held, jobs submitted to `pipe` stay pending. Releasing the hold
    /// completes them.
    pub fn hold(&self, pipe: Pipe, held: bool) {
        let mut state = self.state();
        state.held[pipe.index()] = held;
        if !held {
            state.complete(pipe, None);
        }
    }

    /// Completes all pending jobs on `pipe` while keeping the hold.
    pub fn signal(&self, pipe: Pipe) {
        self.state().complete(pipe, None);
    }

    /// All jobs submitted so far, oldest first.
    pub fn submissions(&self) -> Vec<SimSubmission> {
        self.state().submissions.clone()
    }

    /// Number of jobs that have not completed.
    pub fn pending_jobs(&self) -> usize {
        self.state().pending.len()
    }

    /// Number of open buffer handles.
    pub fn live_handles(&self) -> usize {
        self.state().handles.len()
    }

    /// Number of successful handle closes.
    pub fn closed_handles(&self) -> usize {
        self.state().closed_handles
    }

    /// Number of successful CPU mappings created so far.
    pub fn mmap_count(&self) -> usize {
        self.state().mmap_count
    }

    /// Number of CPU mappings not yet unmapped.
    pub fn live_mappings(&self) -> usize {
        self.state().live_mappings
    }

    /// Number of contexts not yet freed.
    pub fn live_contexts(&self) -> usize {
        self.state().contexts.len()
    }

    /// The GPU address `handle` is mapped at.
    pub fn va_of(&self, handle: u32) -> Option<u32> {
        self.state().va.get(&handle).copied()
    }

    /// Reads `len` bytes at GPU address `va`, which must lie within one
    /// mapped buffer.
    pub fn read_va(&self, va: u32, len: usize) -> Option<Vec<u8>> {
        let state = self.state();
        let (handle, &base) = state.va.iter().find(|&(handle, &base)| {
            state
                .handles
                .get(handle)
                .is_some_and(|obj| {
                    va >= base && u64::from(va) < u64::from(base) + u64::from(obj.size)
                })
        })?;
        let object = state.handles.get(handle)?;
        object.memory.read((va - base) as usize, len)
    }

    /// Reads `len` 32-bit words at GPU address `va`.
    pub fn read_words(&self, va: u32, len: usize) -> Option<Vec<u32>> {
        let bytes = self.read_va(va, len * 4)?;
        Some(
            bytes
                .chunks_exact(4)
                .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
                .collect(),
        )
    }
}

fn inode(fd: BorrowedFd<'_>) -> KernelResult<u64> {
    let file = File::from(fd.try_clone_to_owned().map_err(io_errno)?);
    Ok(file.metadata().map_err(io_errno)?.ino())
}

fn io_errno(err: std::io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

impl Kernel for SimKernel {
    fn query_info(&self) -> KernelResult<GpuInfo> {
        Ok(self.info)
    }

    fn gem_create(&self, size: u32, _flags: u32) -> KernelResult<GemObject> {
        let mut state = self.state();
        state.take_fault(SimOp::GemCreate)?;
        if size == 0 {
            return Err(Errno::EINVAL);
        }
        if size > MAX_OBJECT_SIZE {
            return Err(Errno::ENOMEM);
        }
        let size = size.next_multiple_of(1 << PAGE_SHIFT);
        let object = Arc::new(SimObject {
            memory: SimMemory::new(size as usize),
            size,
        });
        let handle = state.install(object);
        Ok(GemObject { handle, size })
    }

    fn gem_info(&self, handle: u32) -> KernelResult<u64> {
        let mut state = self.state();
        state.take_fault(SimOp::GemInfo)?;
        state.object(handle)?;
        Ok(u64::from(handle) << PAGE_SHIFT)
    }

    fn gem_close(&self, handle: u32) -> KernelResult<()> {
        let mut state = self.state();
        state.handles.remove(&handle).ok_or(Errno::EINVAL)?;
        state.va.remove(&handle);
        state.closed_handles += 1;
        Ok(())
    }

    fn gem_flink(&self, handle: u32) -> KernelResult<u32> {
        let mut state = self.state();
        state.take_fault(SimOp::GemFlink)?;
        let object = state.object(handle)?.clone();
        if let Some((&name, _)) = state
            .names
            .iter()
            .find(|(_, named)| Arc::ptr_eq(named, &object))
        {
            return Ok(name);
        }
        state.next_name += 1;
        let name = state.next_name;
        state.names.insert(name, object);
        Ok(name)
    }

    fn gem_open(&self, name: u32) -> KernelResult<GemObject> {
        let mut state = self.state();
        state.take_fault(SimOp::GemOpen)?;
        let object = state.names.get(&name).ok_or(Errno::ENOENT)?.clone();
        let size = object.size;
        // Like the real driver, every open creates a fresh handle.
        let handle = state.install(object);
        Ok(GemObject { handle, size })
    }

    fn prime_fd_to_handle(&self, fd: BorrowedFd<'_>) -> KernelResult<u32> {
        let ino = inode(fd)?;
        let mut state = self.state();
        state.take_fault(SimOp::PrimeImport)?;
        let object = state.dmabufs.get(&ino).ok_or(Errno::EINVAL)?.1.clone();
        if let Some((&handle, _)) = state
            .handles
            .iter()
            .find(|(_, live)| Arc::ptr_eq(live, &object))
        {
            return Ok(handle);
        }
        Ok(state.install(object))
    }

    fn prime_handle_to_fd(&self, handle: u32) -> KernelResult<OwnedFd> {
        let mut state = self.state();
        state.take_fault(SimOp::PrimeExport)?;
        let object = state.object(handle)?.clone();
        if let Some((keep, _)) = state
            .dmabufs
            .values()
            .find(|(_, exported)| Arc::ptr_eq(exported, &object))
        {
            return keep.try_clone().map_err(io_errno);
        }
        let fd = memfd_create(c"lima-sim-dmabuf", MemFdCreateFlag::MFD_CLOEXEC)?;
        let file = File::from(fd);
        file.set_len(u64::from(object.size)).map_err(io_errno)?;
        let ino = file.metadata().map_err(io_errno)?.ino();
        let fd = OwnedFd::from(file);
        let keep = fd.try_clone().map_err(io_errno)?;
        state.dmabufs.insert(ino, (keep, object));
        Ok(fd)
    }

    unsafe fn mmap(&self, offset: u64, size: usize) -> KernelResult<NonNull<u8>> {
        let mut state = self.state();
        state.take_fault(SimOp::Mmap)?;
        let handle = u32::try_from(offset >> PAGE_SHIFT).map_err(|_| Errno::EINVAL)?;
        let object = state.object(handle)?;
        if size == 0 || size > object.memory.len {
            return Err(Errno::EINVAL);
        }
        let ptr = object.memory.ptr;
        state.live_mappings += 1;
        state.mmap_count += 1;
        Ok(ptr)
    }

    unsafe fn munmap(&self, _ptr: NonNull<u8>, _size: usize) -> KernelResult<()> {
        let mut state = self.state();
        state.live_mappings = state.live_mappings.checked_sub(1).ok_or(Errno::EINVAL)?;
        Ok(())
    }

    fn gem_va(&self, handle: u32, op: VaOp, va: u32) -> KernelResult<()> {
        let mut state = self.state();
        if op == VaOp::Map {
            state.take_fault(SimOp::GemVa)?;
        }
        state.object(handle)?;
        match op {
            VaOp::Map => {
                if state.va.contains_key(&handle) {
                    return Err(Errno::EEXIST);
                }
                state.va.insert(handle, va);
            }
            VaOp::Unmap => {
                if state.va.get(&handle) != Some(&va) {
                    return Err(Errno::ENOENT);
                }
                state.va.remove(&handle);
            }
        }
        Ok(())
    }

    fn gem_submit(&self, request: &SubmitRequest<'_>) -> KernelResult<SubmitResponse> {
        let mut state = self.state();
        state.take_fault(SimOp::GemSubmit)?;
        let frame_size = match request.pipe {
            Pipe::Gp => size_of::<GpFrame>(),
            Pipe::Pp => size_of::<PpFrame>(),
        };
        if request.frame.len() != frame_size {
            return Err(Errno::EINVAL);
        }
        for bo in request.bos {
            state.object(bo.handle)?;
        }
        let held = state.held[request.pipe.index()];
        let context = state.contexts.get_mut(&request.ctx).ok_or(Errno::ENOENT)?;
        let pipe = &mut context.pipes[request.pipe.index()];
        pipe.last_seq += 1;
        let seq = pipe.last_seq;
        let sync_fd = if request.flags.contains(SubmitFlags::SYNC_FD_OUT) {
            let (read, write) = nix::unistd::pipe()?;
            pipe.waiters.push((seq, write));
            Some(read)
        } else {
            None
        };
        state.pending.push(Pending {
            ctx: request.ctx,
            pipe: request.pipe,
            seq,
            bos: request.bos.to_vec(),
        });
        state.submissions.push(SimSubmission {
            ctx: request.ctx,
            pipe: request.pipe,
            seq,
            bos: request.bos.to_vec(),
            frame: request.frame.to_vec(),
        });
        if !held {
            state.complete(request.pipe, Some(request.ctx));
        }
        Ok(SubmitResponse {
            fence: seq,
            sync_fd,
        })
    }

    fn wait_fence(&self, ctx: u32, pipe: Pipe, seq: u32, _deadline: u64) -> KernelResult<()> {
        let mut state = self.state();
        state.take_fault(SimOp::WaitFence)?;
        let context = state.contexts.get(&ctx).ok_or(Errno::ENOENT)?;
        let pipe = &context.pipes[pipe.index()];
        if seq > pipe.last_seq {
            return Err(Errno::EINVAL);
        }
        if seq <= pipe.completed {
            Ok(())
        } else {
            Err(Errno::ETIMEDOUT)
        }
    }

    fn gem_wait(&self, handle: u32, access: BoAccess, _deadline: u64) -> KernelResult<()> {
        let mut state = self.state();
        state.take_fault(SimOp::GemWait)?;
        state.object(handle)?;
        // Readers wait for GPU writers; writers wait for every GPU user.
        let busy = state.pending.iter().any(|job| {
            job.bos.iter().any(|bo| {
                bo.handle == handle
                    && (access.contains(BoAccess::WRITE) || bo.access.contains(BoAccess::WRITE))
            })
        });
        if busy {
            Err(Errno::ETIMEDOUT)
        } else {
            Ok(())
        }
    }

    fn fence_export(&self, ctx: u32, pipe: Pipe, seq: u32) -> KernelResult<OwnedFd> {
        let mut state = self.state();
        let context = state.contexts.get_mut(&ctx).ok_or(Errno::ENOENT)?;
        let pipe = &mut context.pipes[pipe.index()];
        if seq > pipe.last_seq {
            return Err(Errno::EINVAL);
        }
        let (read, write) = nix::unistd::pipe()?;
        if seq > pipe.completed {
            pipe.waiters.push((seq, write));
        }
        Ok(read)
    }

    fn ctx_create(&self) -> KernelResult<u32> {
        let mut state = self.state();
        state.take_fault(SimOp::CtxCreate)?;
        state.next_ctx += 1;
        let id = state.next_ctx;
        state.contexts.insert(id, SimContext::default());
        Ok(id)
    }

    fn ctx_free(&self, ctx: u32) -> KernelResult<()> {
        let mut state = self.state();
        state.contexts.remove(&ctx).ok_or(Errno::EINVAL)?;
        state.pending.retain(|job| job.ctx != ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;

    use super::*;

    fn submit(sim: &SimKernel, ctx: u32, pipe: Pipe, bos: &[SubmitBo]) -> u32 {
        let frame = match pipe {
            Pipe::Gp => bytemuck::bytes_of(&GpFrame::default()).to_vec(),
            Pipe::Pp => bytemuck::bytes_of(&PpFrame::default()).to_vec(),
        };
        sim.gem_submit(&SubmitRequest {
            ctx,
            pipe,
            bos,
            frame: &frame,
            flags: SubmitFlags::empty(),
        })
        .unwrap()
        .fence
    }

    #[test]
    fn sizes_round_to_pages() {
        let sim = SimKernel::mali400(2);
        let obj = sim.gem_create(100, 0).unwrap();
        assert_eq!(obj.size, 4096);
        assert_eq!(sim.gem_create(0, 0), Err(Errno::EINVAL));
    }

    #[test]
    fn open_by_name_creates_a_new_handle() {
        let sim = SimKernel::mali400(2);
        let obj = sim.gem_create(4096, 0).unwrap();
        let name = sim.gem_flink(obj.handle).unwrap();
        assert_eq!(sim.gem_flink(obj.handle), Ok(name));
        let opened = sim.gem_open(name).unwrap();
        assert_ne!(opened.handle, obj.handle);
        assert_eq!(opened.size, obj.size);
    }

    #[test]
    fn prime_import_returns_the_existing_handle() {
        let sim = SimKernel::mali400(2);
        let obj = sim.gem_create(8192, 0).unwrap();
        let fd = sim.prime_handle_to_fd(obj.handle).unwrap();
        assert_eq!(sim.prime_fd_to_handle(fd.as_fd()), Ok(obj.handle));
        sim.gem_close(obj.handle).unwrap();
        let reimported = sim.prime_fd_to_handle(fd.as_fd()).unwrap();
        assert_ne!(reimported, obj.handle);
    }

    #[test]
    fn held_pipes_keep_jobs_pending() {
        let sim = SimKernel::mali400(1);
        let ctx = sim.ctx_create().unwrap();
        let obj = sim.gem_create(4096, 0).unwrap();
        let bo = SubmitBo {
            handle: obj.handle,
            access: BoAccess::WRITE,
        };
        sim.hold(Pipe::Pp, true);
        let seq = submit(&sim, ctx, Pipe::Pp, &[bo]);
        assert_eq!(seq, 1);
        assert_eq!(sim.wait_fence(ctx, Pipe::Pp, seq, 0), Err(Errno::ETIMEDOUT));
        assert_eq!(sim.gem_wait(obj.handle, BoAccess::READ, 0), Err(Errno::ETIMEDOUT));
        sim.signal(Pipe::Pp);
        assert_eq!(sim.wait_fence(ctx, Pipe::Pp, seq, 0), Ok(()));
        assert_eq!(sim.gem_wait(obj.handle, BoAccess::READ, 0), Ok(()));
        assert_eq!(sim.wait_fence(ctx, Pipe::Pp, seq + 1, 0), Err(Errno::EINVAL));
    }

    #[test]
    fn readers_do_not_wait_for_gpu_readers() {
        let sim = SimKernel::mali400(1);
        let ctx = sim.ctx_create().unwrap();
        let obj = sim.gem_create(4096, 0).unwrap();
        let bo = SubmitBo {
            handle: obj.handle,
            access: BoAccess::READ,
        };
        sim.hold(Pipe::Gp, true);
        submit(&sim, ctx, Pipe::Gp, &[bo]);
        assert_eq!(sim.gem_wait(obj.handle, BoAccess::READ, 0), Ok(()));
        assert_eq!(sim.gem_wait(obj.handle, BoAccess::WRITE, 0), Err(Errno::ETIMEDOUT));
    }

    #[test]
    fn frames_must_match_the_pipe() {
        let sim = SimKernel::mali400(1);
        let ctx = sim.ctx_create().unwrap();
        let result = sim.gem_submit(&SubmitRequest {
            ctx,
            pipe: Pipe::Pp,
            bos: &[],
            frame: bytemuck::bytes_of(&GpFrame::default()),
            flags: SubmitFlags::empty(),
        });
        assert_eq!(result.unwrap_err(), Errno::EINVAL);
    }

    #[test]
    fn faults_fire_once() {
        let sim = SimKernel::mali400(1);
        sim.inject_fault(SimOp::GemCreate, Errno::ENOMEM);
        assert_eq!(sim.gem_create(4096, 0), Err(Errno::ENOMEM));
        assert!(sim.gem_create(4096, 0).is_ok());
    }

    #[test]
    fn gpu_addresses_read_back() {
        let sim = SimKernel::mali400(1);
        let obj = sim.gem_create(4096, 0).unwrap();
        let offset = sim.gem_info(obj.handle).unwrap();
        // SAFETY: the handle is live and unmapped before the test ends.
        let ptr = unsafe { sim.mmap(offset, 4096) }.unwrap();
        // SAFETY: the mapping is 4096 bytes long.
        unsafe { ptr.cast::<u32>().add(1).write_unaligned(0xdead_beef) };
        sim.gem_va(obj.handle, VaOp::Map, 0x10_0000).unwrap();
        assert_eq!(sim.read_words(0x10_0004, 1), Some(vec![0xdead_beef]));
        assert_eq!(sim.read_va(0x10_1000, 4), None);
        // SAFETY: mapped above.
        unsafe { sim.munmap(ptr, 4096) }.unwrap();
        assert_eq!(sim.live_mappings(), 0);
    }
}
