// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-pipe job submission.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::bo::Bo;
use crate::fence::Fence;
use crate::kernel::{absolute_timeout, BoAccess, Kernel, Pipe, SubmitBo, SubmitFlags, SubmitRequest};
use crate::screen::ScreenInner;
use crate::{Error, Result};

/// How long dropping a queue waits for its jobs, in nanoseconds.
const DRAIN_TIMEOUT_NS: u64 = 1_000_000_000;

/// A kernel context, freed when the last queue and fence using it go away.
pub(crate) struct KernelContext {
    screen: Arc<ScreenInner>,
    id: u32,
}

impl KernelContext {
    pub fn new(screen: &Arc<ScreenInner>) -> Result<Arc<Self>> {
        let id = screen.kernel.ctx_create()?;
        log::debug!("submit: created kernel context {id}");
        Ok(Arc::new(Self {
            screen: screen.clone(),
            id,
        }))
    }
}

impl Drop for KernelContext {
    fn drop(&mut self) {
        if let Err(errno) = self.screen.kernel.ctx_free(self.id) {
            log::warn!("submit: freeing kernel context {} failed: {errno}", self.id);
        }
    }
}

/// The part of a queue that fences refer back to.
#[derive(Debug)]
pub(crate) struct QueueState {
    kctx: Arc<KernelContext>,
    pipe: Pipe,
    /// Sequence number of the last submitted job.
    last_seq: AtomicU32,
    /// Highest sequence number known complete.
    completed: AtomicU32,
}

impl std::fmt::Debug for KernelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("KernelContext").field(&self.id).finish()
    }
}

impl QueueState {
    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kctx.screen.kernel
    }

    pub fn ctx_id(&self) -> u32 {
        self.kctx.id
    }

    pub fn is_complete(&self, seq: u32) -> bool {
        seq <= self.completed.load(Ordering::Acquire)
    }

    /// Waits for job `seq`. The deadline is computed right before blocking.
    pub fn wait(&self, seq: u32, timeout_ns: u64, relative: bool) -> Result<()> {
        if self.is_complete(seq) {
            return Ok(());
        }
        let deadline = absolute_timeout(timeout_ns, relative)?;
        self.kernel()
            .wait_fence(self.kctx.id, self.pipe, seq, deadline)
            .map_err(Error::from_wait)?;
        self.completed.fetch_max(seq, Ordering::AcqRel);
        Ok(())
    }
}

/// Collects the buffers and frame descriptor of the next job on one pipe.
///
/// Buffers of submitted jobs stay referenced until the job is known to be
/// complete, so they cannot be freed while the GPU may still use them.
pub struct SubmitQueue {
    state: Arc<QueueState>,
    bos: SmallVec<[(Bo, BoAccess); 8]>,
    /// Position in `bos` by kernel handle.
    index: HashMap<u32, usize>,
    frame: Vec<u8>,
    in_flight: VecDeque<(u32, Vec<Bo>)>,
}

impl SubmitQueue {
    pub(crate) fn new(kctx: Arc<KernelContext>, pipe: Pipe) -> Self {
        Self {
            state: Arc::new(QueueState {
                kctx,
                pipe,
                last_seq: AtomicU32::new(0),
                completed: AtomicU32::new(0),
            }),
            bos: SmallVec::new(),
            index: HashMap::new(),
            frame: Vec::new(),
            in_flight: VecDeque::new(),
        }
    }

    pub fn pipe(&self) -> Pipe {
        self.state.pipe
    }

    /// Adds a buffer to the next job. Adding it again widens its access.
    ///
    /// Buffers of another screen are rejected with
    /// [`InvalidHandle`](Error::InvalidHandle): their handles mean nothing to
    /// this device file.
    pub fn add_bo(&mut self, bo: &Bo, access: BoAccess) -> Result<()> {
        if !bo.belongs_to(&self.state.kctx.screen) {
            return Err(Error::InvalidHandle(bo.handle()));
        }
        match self.index.get(&bo.handle()) {
            Some(&i) => self.bos[i].1 |= access,
            None => {
                self.index.insert(bo.handle(), self.bos.len());
                self.bos.push((bo.clone(), access));
            }
        }
        Ok(())
    }

    /// Whether the next job references `bo`, for writing if `write` is set.
    pub fn has_bo(&self, bo: &Bo, write: bool) -> bool {
        self.access_of(bo)
            .is_some_and(|access| !write || access.contains(BoAccess::WRITE))
    }

    /// The access the next job declares for `bo`.
    pub fn access_of(&self, bo: &Bo) -> Option<BoAccess> {
        let &i = self.index.get(&bo.handle())?;
        Some(self.bos[i].1)
    }

    pub fn bo_count(&self) -> usize {
        self.bos.len()
    }

    /// Sets the frame descriptor of the next job.
    pub fn set_frame_payload(&mut self, frame: &[u8]) {
        self.frame.clear();
        self.frame.extend_from_slice(frame);
    }

    pub fn frame_payload(&self) -> &[u8] {
        &self.frame
    }

    /// Drops the buffers and frame of the next job without submitting it.
    pub fn discard(&mut self) {
        self.bos.clear();
        self.index.clear();
        self.frame.clear();
    }

    /// Submits the next job.
    ///
    /// On failure nothing is consumed and the job can be submitted again.
    pub fn start(&mut self) -> Result<Fence> {
        self.submit(SubmitFlags::empty())
    }

    /// Like [`SubmitQueue::start`], returning a fence backed by a sync file.
    pub fn start_sync_fd(&mut self) -> Result<Fence> {
        self.submit(SubmitFlags::SYNC_FD_OUT)
    }

    fn submit(&mut self, flags: SubmitFlags) -> Result<Fence> {
        self.retire();
        let bos: Vec<SubmitBo> = self
            .bos
            .iter()
            .map(|(bo, access)| SubmitBo {
                handle: bo.handle(),
                access: *access,
            })
            .collect();
        let request = SubmitRequest {
            ctx: self.state.kctx.id,
            pipe: self.state.pipe,
            bos: &bos,
            frame: &self.frame,
            flags,
        };
        let response = self.state.kernel().gem_submit(&request)?;
        let seq = response.fence;
        log::debug!(
            "submit: {:?} job {seq} with {} buffers",
            self.state.pipe,
            bos.len()
        );
        self.state.last_seq.store(seq, Ordering::Release);
        self.index.clear();
        self.frame.clear();
        let retained = self.bos.drain(..).map(|(bo, _)| bo).collect();
        self.in_flight.push_back((seq, retained));
        Ok(match response.sync_fd {
            Some(fd) => Fence::from_sync_fd(fd),
            None => Fence::native(self.state.pipe, seq, Arc::downgrade(&self.state)),
        })
    }

    /// Waits for job `seq` on this queue.
    ///
    /// Returns immediately if the job is already known to be complete.
    /// Relative timeouts are measured from the moment the wait starts.
    pub fn wait(&mut self, seq: u32, timeout_ns: u64, relative: bool) -> Result<()> {
        self.state.wait(seq, timeout_ns, relative)?;
        self.retire();
        Ok(())
    }

    /// Retires every job that has finished, without blocking.
    pub fn poll(&mut self) {
        while let Some(&(seq, _)) = self.in_flight.front() {
            if self.state.wait(seq, 0, false).is_err() {
                break;
            }
            self.in_flight.pop_front();
        }
    }

    fn retire(&mut self) {
        while self
            .in_flight
            .front()
            .is_some_and(|(seq, _)| self.state.is_complete(*seq))
        {
            self.in_flight.pop_front();
        }
    }

    /// The sequence number of the last submitted job, 0 if none.
    pub fn last_seq(&self) -> u32 {
        self.state.last_seq.load(Ordering::Acquire)
    }

    /// A fence for the last submitted job.
    pub fn last_fence(&self) -> Option<Fence> {
        let seq = self.last_seq();
        (seq != 0).then(|| Fence::native(self.state.pipe, seq, Arc::downgrade(&self.state)))
    }

    /// Number of submitted jobs whose buffers are still retained.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl Drop for SubmitQueue {
    fn drop(&mut self) {
        let seq = self.last_seq();
        if seq != 0 {
            if let Err(err) = self.state.wait(seq, DRAIN_TIMEOUT_NS, true) {
                log::warn!(
                    "submit: {:?} job {seq} still running at teardown: {err}",
                    self.state.pipe
                );
            }
        }
    }
}

impl std::fmt::Debug for SubmitQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitQueue")
            .field("pipe", &self.state.pipe)
            .field("bos", &self.bos.len())
            .field("last_seq", &self.last_seq())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use lima_encoding::GpFrame;
    use nix::errno::Errno;

    use super::{KernelContext, SubmitQueue};
    use crate::sim::{SimKernel, SimOp};
    use crate::{BoAccess, Error, Pipe, Screen, ScreenOptions};

    fn gp_queue() -> (Arc<SimKernel>, Screen, SubmitQueue) {
        let sim = Arc::new(SimKernel::mali400(1));
        let screen = Screen::new(sim.clone(), ScreenOptions::default()).unwrap();
        let kctx = KernelContext::new(&screen.0).unwrap();
        let mut queue = SubmitQueue::new(kctx, Pipe::Gp);
        queue.set_frame_payload(bytemuck::bytes_of(&GpFrame::default()));
        (sim, screen, queue)
    }

    #[test]
    fn adding_twice_merges_access() {
        let (_sim, screen, mut queue) = gp_queue();
        let bo = screen.bo_create(4096, 0).unwrap();
        queue.add_bo(&bo, BoAccess::READ).unwrap();
        queue.add_bo(&bo, BoAccess::WRITE).unwrap();
        assert_eq!(queue.bo_count(), 1);
        assert_eq!(queue.access_of(&bo), Some(BoAccess::READ | BoAccess::WRITE));
        assert!(queue.has_bo(&bo, true));
    }

    #[test]
    fn start_moves_buffers_in_flight() {
        let (sim, screen, mut queue) = gp_queue();
        let bo = screen.bo_create(4096, 0).unwrap();
        queue.add_bo(&bo, BoAccess::READ).unwrap();
        sim.hold(Pipe::Gp, true);
        let fence = queue.start().unwrap();
        assert_eq!(fence.seq(), Some((Pipe::Gp, 1)));
        assert_eq!(queue.bo_count(), 0);
        assert!(queue.frame_payload().is_empty());
        assert_eq!(bo.refcount(), 2);
        queue.poll();
        assert_eq!(queue.in_flight(), 1);
        sim.hold(Pipe::Gp, false);
        queue.poll();
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(bo.refcount(), 1);
    }

    #[test]
    fn failed_start_keeps_the_job() {
        let (sim, screen, mut queue) = gp_queue();
        let bo = screen.bo_create(4096, 0).unwrap();
        queue.add_bo(&bo, BoAccess::WRITE).unwrap();
        sim.inject_fault(SimOp::GemSubmit, Errno::EINVAL);
        assert!(matches!(
            queue.start(),
            Err(Error::KernelRejected(Errno::EINVAL))
        ));
        assert_eq!(queue.bo_count(), 1);
        assert_eq!(queue.last_seq(), 0);
        queue.start().unwrap();
        assert_eq!(sim.submissions().len(), 1);
        assert_eq!(sim.submissions()[0].access(bo.handle()), Some(BoAccess::WRITE));
    }

    #[test]
    fn sequence_numbers_increase() {
        let (_sim, _screen, mut queue) = gp_queue();
        let frame = queue.frame_payload().to_vec();
        let mut last = 0;
        for _ in 0..4 {
            queue.set_frame_payload(&frame);
            let (_, seq) = queue.start().unwrap().seq().unwrap();
            assert!(seq > last);
            last = seq;
        }
    }

    #[test]
    fn unfinished_waits_time_out() {
        let (sim, _screen, mut queue) = gp_queue();
        sim.hold(Pipe::Gp, true);
        let fence = queue.start().unwrap();
        let (_, seq) = fence.seq().unwrap();
        assert!(matches!(queue.wait(seq, 1_000, true), Err(Error::Timeout)));
        assert!(fence
            .wait(Some(Duration::from_millis(1)))
            .unwrap_err()
            .is_timeout());
        sim.signal(Pipe::Gp);
        queue.wait(seq, 0, true).unwrap();
        fence.wait(None).unwrap();
    }

    #[test]
    fn completed_waits_skip_the_kernel() {
        let (sim, _screen, mut queue) = gp_queue();
        let (_, seq) = queue.start().unwrap().seq().unwrap();
        queue.wait(seq, 0, true).unwrap();
        sim.inject_fault(SimOp::WaitFence, Errno::EIO);
        queue.wait(seq, 0, true).unwrap();
    }

    #[test]
    fn sync_fd_fences_signal() {
        let (sim, _screen, mut queue) = gp_queue();
        sim.hold(Pipe::Gp, true);
        let fence = queue.start_sync_fd().unwrap();
        assert!(fence.as_fd().is_some());
        assert!(matches!(
            fence.wait(Some(Duration::ZERO)),
            Err(Error::Timeout)
        ));
        sim.signal(Pipe::Gp);
        fence.wait(Some(Duration::from_secs(1))).unwrap();
    }

    #[test]
    fn fences_outliving_their_queue_are_lost() {
        let (_sim, _screen, mut queue) = gp_queue();
        let fence = queue.start().unwrap();
        drop(queue);
        assert!(matches!(fence.wait(None), Err(Error::ContextLost)));
    }
}
