// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Completion fences.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::kernel::{Pipe, NO_DEADLINE};
use crate::submit::QueueState;
use crate::{Error, Result};

#[derive(Debug)]
enum FenceKind {
    /// A job on one of our own queues.
    Native {
        pipe: Pipe,
        seq: u32,
        queue: Weak<QueueState>,
    },
    /// A sync file, signalled by becoming readable.
    Exported(OwnedFd),
}

/// The time left until `deadline`, as seen at `now`.
fn poll_timeout(deadline: Option<Instant>, now: Instant) -> PollTimeout {
    match deadline {
        Some(deadline) => PollTimeout::try_from(deadline.saturating_duration_since(now))
            .unwrap_or(PollTimeout::MAX),
        None => PollTimeout::NONE,
    }
}

/// The completion of a submitted job.
///
/// Cloning is cheap; all clones refer to the same fence.
#[derive(Clone, Debug)]
pub struct Fence(Arc<FenceKind>);

impl Fence {
    pub(crate) fn native(pipe: Pipe, seq: u32, queue: Weak<QueueState>) -> Self {
        Self(Arc::new(FenceKind::Native { pipe, seq, queue }))
    }

    /// Wraps a sync file descriptor, for example one received from another
    /// process.
    pub fn from_sync_fd(fd: OwnedFd) -> Self {
        Self(Arc::new(FenceKind::Exported(fd)))
    }

    /// The pipe and sequence number of a native fence.
    pub fn seq(&self) -> Option<(Pipe, u32)> {
        match &*self.0 {
            FenceKind::Native { pipe, seq, .. } => Some((*pipe, *seq)),
            FenceKind::Exported(_) => None,
        }
    }

    /// The sync file descriptor of an exported fence.
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        match &*self.0 {
            FenceKind::Native { .. } => None,
            FenceKind::Exported(fd) => Some(fd.as_fd()),
        }
    }

    /// Blocks until the fence signals, or until `timeout` passes.
    ///
    /// `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        match &*self.0 {
            FenceKind::Native { seq, queue, .. } => {
                let queue = queue.upgrade().ok_or(Error::ContextLost)?;
                match timeout {
                    Some(timeout) => {
                        let ns = u64::try_from(timeout.as_nanos()).unwrap_or(NO_DEADLINE);
                        queue.wait(*seq, ns, true)
                    }
                    None => queue.wait(*seq, NO_DEADLINE, false),
                }
            }
            FenceKind::Exported(fd) => {
                // An unrepresentable deadline is as good as none.
                let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
                let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
                loop {
                    match poll(&mut fds, poll_timeout(deadline, Instant::now())) {
                        Ok(0) => return Err(Error::Timeout),
                        Ok(_) => return Ok(()),
                        Err(Errno::EINTR) => continue,
                        Err(errno) => return Err(errno.into()),
                    }
                }
            }
        }
    }

    /// Turns the fence into a sync file another process can wait on.
    pub fn export(&self) -> Result<Fence> {
        match &*self.0 {
            FenceKind::Native { pipe, seq, queue } => {
                let queue = queue.upgrade().ok_or(Error::ContextLost)?;
                let fd = queue
                    .kernel()
                    .fence_export(queue.ctx_id(), *pipe, *seq)
                    .map_err(|errno| match errno {
                        Errno::EOPNOTSUPP => Error::Unsupported,
                        errno => Error::KernelRejected(errno),
                    })?;
                Ok(Self::from_sync_fd(fd))
            }
            FenceKind::Exported(fd) => Ok(Self::from_sync_fd(fd.try_clone()?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use nix::poll::PollTimeout;

    use super::poll_timeout;

    #[test]
    fn poll_timeouts_shrink_towards_the_deadline() {
        let start = Instant::now();
        let deadline = Some(start + Duration::from_millis(50));
        assert_eq!(poll_timeout(deadline, start), PollTimeout::from(50_u16));
        // A retry after an interrupted poll only gets the rest.
        let later = start + Duration::from_millis(30);
        assert_eq!(poll_timeout(deadline, later), PollTimeout::from(20_u16));
        let past = start + Duration::from_secs(1);
        assert_eq!(poll_timeout(deadline, past), PollTimeout::ZERO);
        assert_eq!(poll_timeout(None, start), PollTimeout::NONE);
    }

    #[test]
    fn distant_deadlines_are_clamped() {
        let start = Instant::now();
        let deadline = Some(start + Duration::from_secs(60 * 60 * 24 * 365));
        assert_eq!(poll_timeout(deadline, start), PollTimeout::MAX);
    }
}
