// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::time::Duration;

use anyhow::Result;
use lima::sim::SimOp;
use lima::{BoAccess, Errno, Error, Fence, Pipe};
use lima_encoding::GpFrame;
use lima_tests::{TestDevice, TestParams};

fn gp_payload() -> GpFrame {
    GpFrame {
        vs_cmd_start: 0x10_0000,
        vs_cmd_end: 0x10_0000,
        plbu_cmd_start: 0x10_0000,
        plbu_cmd_end: 0x10_0000,
        ..Default::default()
    }
}

#[test]
fn repeated_buffers_merge_their_access() -> Result<()> {
    let dev = TestDevice::new(&TestParams::default())?;
    let mut ctx = dev.screen.create_context()?;
    let bo = dev.screen.bo_create(4096, 0)?;
    let queue = ctx.queue_mut(Pipe::Gp);
    queue.add_bo(&bo, BoAccess::READ)?;
    queue.add_bo(&bo, BoAccess::WRITE)?;
    assert_eq!(queue.bo_count(), 1);
    assert_eq!(queue.access_of(&bo), Some(BoAccess::READ | BoAccess::WRITE));

    queue.set_frame_payload(bytemuck::bytes_of(&gp_payload()));
    queue.start()?;
    let job = dev.sim.submissions().remove(0);
    assert_eq!(job.bos.len(), 1);
    assert_eq!(job.access(bo.handle()), Some(BoAccess::READ | BoAccess::WRITE));
    Ok(())
}

#[test]
fn buffers_of_another_screen_are_rejected() -> Result<()> {
    let dev = TestDevice::new(&TestParams::default())?;
    let other = TestDevice::new(&TestParams::default())?;
    let mut ctx = dev.screen.create_context()?;
    let foreign = other.screen.bo_create(4096, 0)?;
    let queue = ctx.queue_mut(Pipe::Gp);
    assert!(matches!(
        queue.add_bo(&foreign, BoAccess::READ),
        Err(Error::InvalidHandle(handle)) if handle == foreign.handle()
    ));
    assert_eq!(queue.bo_count(), 0);
    Ok(())
}

#[test]
fn sequence_numbers_increase_per_pipe() -> Result<()> {
    let dev = TestDevice::new(&TestParams::default())?;
    let mut ctx = dev.screen.create_context()?;
    dev.sim.hold(Pipe::Gp, true);
    let queue = ctx.queue_mut(Pipe::Gp);
    let mut seqs = Vec::new();
    for _ in 0..4 {
        queue.set_frame_payload(bytemuck::bytes_of(&gp_payload()));
        let fence = queue.start()?;
        seqs.push(fence.seq().map(|(_, seq)| seq).unwrap_or_default());
    }
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{seqs:?}");
    assert_eq!(queue.last_seq(), seqs[3]);

    dev.sim.signal(Pipe::Gp);
    queue.wait(seqs[2], 0, true)?;
    // Already known complete: no kernel call is made, so an armed fault
    // stays armed.
    dev.sim.inject_fault(SimOp::WaitFence, Errno::EIO);
    queue.wait(seqs[0], 0, true)?;
    queue.wait(seqs[2], 0, true)?;
    assert!(matches!(
        queue.wait(seqs[3], 0, true),
        Err(Error::KernelRejected(Errno::EIO))
    ));
    Ok(())
}

#[test]
fn expired_deadlines_are_timeouts() -> Result<()> {
    let dev = TestDevice::new(&TestParams::default())?;
    let mut ctx = dev.screen.create_context()?;
    dev.sim.hold(Pipe::Gp, true);
    let queue = ctx.queue_mut(Pipe::Gp);
    queue.set_frame_payload(bytemuck::bytes_of(&gp_payload()));
    let fence = queue.start()?;
    let err = fence.wait(Some(Duration::from_millis(1))).unwrap_err();
    assert!(err.is_timeout(), "{err}");
    assert!(matches!(queue.wait(1, 1_000, true), Err(Error::Timeout)));

    dev.sim.hold(Pipe::Gp, false);
    fence.wait(Some(Duration::from_millis(1)))?;
    Ok(())
}

#[test]
fn failed_submissions_can_be_retried() -> Result<()> {
    let dev = TestDevice::new(&TestParams::default())?;
    let mut ctx = dev.screen.create_context()?;
    let bo = dev.screen.bo_create(4096, 0)?;
    let queue = ctx.queue_mut(Pipe::Gp);
    queue.add_bo(&bo, BoAccess::READ)?;
    queue.set_frame_payload(bytemuck::bytes_of(&gp_payload()));
    dev.sim.inject_fault(SimOp::GemSubmit, Errno::EBUSY);
    assert!(queue.start().is_err());
    assert_eq!(queue.bo_count(), 1);
    assert_eq!(queue.last_seq(), 0);
    assert!(dev.sim.submissions().is_empty());

    let fence = queue.start()?;
    assert_eq!(fence.seq(), Some((Pipe::Gp, 1)));
    assert_eq!(queue.bo_count(), 0);
    assert_eq!(dev.sim.submissions()[0].access(bo.handle()), Some(BoAccess::READ));
    Ok(())
}

#[test]
fn in_flight_jobs_keep_their_buffers_alive() -> Result<()> {
    let dev = TestDevice::new(&TestParams::default())?;
    let mut ctx = dev.screen.create_context()?;
    dev.sim.hold(Pipe::Gp, true);
    let live = dev.screen.bo_count();
    let closed = dev.sim.closed_handles();
    let bo = dev.screen.bo_create(4096, 0)?;
    let queue = ctx.queue_mut(Pipe::Gp);
    queue.add_bo(&bo, BoAccess::READ)?;
    queue.set_frame_payload(bytemuck::bytes_of(&gp_payload()));
    let fence = queue.start()?;
    drop(bo);
    assert_eq!(dev.screen.bo_count(), live + 1);
    assert_eq!(queue.in_flight(), 1);

    dev.sim.hold(Pipe::Gp, false);
    queue.poll();
    assert_eq!(queue.in_flight(), 0);
    assert_eq!(dev.screen.bo_count(), live);
    assert_eq!(dev.sim.closed_handles(), closed + 1);
    fence.wait(None)?;
    Ok(())
}

#[test]
fn exported_fences_signal_with_the_job() -> Result<()> {
    let dev = TestDevice::new(&TestParams::default())?;
    let mut ctx = dev.screen.create_context()?;
    dev.sim.hold(Pipe::Gp, true);
    let queue = ctx.queue_mut(Pipe::Gp);
    queue.set_frame_payload(bytemuck::bytes_of(&gp_payload()));
    let native = queue.start()?;
    let exported = native.export()?;
    assert!(exported.seq().is_none());
    assert!(exported.as_fd().is_some());
    assert!(exported
        .wait(Some(Duration::from_millis(1)))
        .is_err_and(|err| err.is_timeout()));

    dev.sim.hold(Pipe::Gp, false);
    exported.wait(Some(Duration::from_secs(1)))?;
    // A fence exported after completion is signalled from the start.
    native.export()?.wait(Some(Duration::ZERO))?;
    Ok(())
}

#[test]
fn sync_fd_submissions_return_file_fences() -> Result<()> {
    let dev = TestDevice::new(&TestParams::default())?;
    let mut ctx = dev.screen.create_context()?;
    let queue = ctx.queue_mut(Pipe::Gp);
    queue.set_frame_payload(bytemuck::bytes_of(&gp_payload()));
    let fence: Fence = queue.start_sync_fd()?;
    assert!(fence.as_fd().is_some());
    fence.wait(Some(Duration::from_secs(1)))?;
    Ok(())
}

#[test]
fn fences_outliving_their_context_report_it() -> Result<()> {
    let dev = TestDevice::new(&TestParams::default())?;
    let mut ctx = dev.screen.create_context()?;
    let queue = ctx.queue_mut(Pipe::Gp);
    queue.set_frame_payload(bytemuck::bytes_of(&gp_payload()));
    let fence = queue.start()?;
    drop(ctx);
    assert!(matches!(fence.wait(None), Err(Error::ContextLost)));
    assert_eq!(dev.sim.live_contexts(), 0);
    Ok(())
}
