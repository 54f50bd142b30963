// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-frame suballocation of GPU-visible memory.
//!
//! Command streams, descriptor tables and uniforms live only as long as the
//! frame that uses them. They are bump allocated out of fixed-size blocks,
//! and a block is recycled once nothing but the arena references it, which
//! happens when the jobs that read it have been retired by their queues.

use crate::bo::Bo;
use crate::bufwrite::BufWrite;
use crate::kernel::{BoAccess, Pipe};
use crate::screen::Screen;
use crate::Result;

/// Size of the blocks allocations are carved from.
pub(crate) const BLOCK_SIZE: u32 = 64 * 1024;

/// Alignment of every allocation.
pub(crate) const ALIGNMENT: u32 = 0x40;

/// Idle blocks kept for reuse after a frame.
const MAX_IDLE_BLOCKS: usize = 8;

/// What a scratch allocation holds, which decides the jobs that use it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScratchRole {
    /// Vertex shader unit command stream.
    GpVsCmd,
    /// Polygon list builder command stream.
    GpPlbuCmd,
    /// Vertex shader uniforms.
    GpUniform,
    /// Attribute descriptor table.
    GpAttributeInfo,
    /// Varying descriptor table.
    GpVaryingInfo,
    /// Varyings written by the vertex shader and read back by the PP.
    GpVaryings,
    /// Render state records.
    PpRenderState,
    /// Fragment shader uniforms.
    PpUniform,
    /// Table of fragment uniform block addresses.
    PpUniformArray,
    /// Texture descriptors.
    PpTextureDesc,
}

impl ScratchRole {
    /// The queues an allocation of this role is added to, with the access
    /// their jobs make.
    pub fn usage(self) -> &'static [(Pipe, BoAccess)] {
        const GP_READ: &[(Pipe, BoAccess)] = &[(Pipe::Gp, BoAccess::READ)];
        const PP_READ: &[(Pipe, BoAccess)] = &[(Pipe::Pp, BoAccess::READ)];
        const VARYINGS: &[(Pipe, BoAccess)] = &[
            (Pipe::Gp, BoAccess::READ.union(BoAccess::WRITE)),
            (Pipe::Pp, BoAccess::READ),
        ];
        match self {
            Self::GpVsCmd
            | Self::GpPlbuCmd
            | Self::GpUniform
            | Self::GpAttributeInfo
            | Self::GpVaryingInfo => GP_READ,
            Self::GpVaryings => VARYINGS,
            Self::PpRenderState | Self::PpUniform | Self::PpUniformArray | Self::PpTextureDesc => {
                PP_READ
            }
        }
    }
}

/// A range of a scratch buffer, mapped on the CPU and the GPU.
#[derive(Clone, Debug)]
pub struct ScratchAlloc {
    bo: Bo,
    offset: u32,
    va: u32,
    size: u32,
}

impl ScratchAlloc {
    pub fn bo(&self) -> &Bo {
        &self.bo
    }

    /// Byte offset of the range in [`ScratchAlloc::bo`].
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// GPU address of the start of the range.
    pub fn va(&self) -> u32 {
        self.va
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Copies `bytes` to the start of the range.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        self.check(bytes.len())?;
        self.bo.write(self.offset, bytes)
    }

    /// A sequential writer over the whole range.
    pub fn writer(&self) -> Result<BufWrite<'_>> {
        self.bo.writer(self.offset, self.size as usize)
    }

    fn check(&self, len: usize) -> Result<()> {
        if len > self.size as usize {
            return Err(crate::Error::InvalidRange {
                offset: u64::from(self.offset),
                size: len as u64,
            });
        }
        Ok(())
    }
}

/// Bump allocator over recycled blocks.
pub(crate) struct ScratchArena {
    screen: Screen,
    /// The block being allocated from and its used bytes.
    current: Option<(Bo, u32)>,
    /// Blocks used by earlier frames.
    retired: Vec<Bo>,
}

impl ScratchArena {
    pub fn new(screen: Screen) -> Self {
        Self {
            screen,
            current: None,
            retired: Vec::new(),
        }
    }

    /// Allocates `size` bytes. Allocations larger than a block get a buffer
    /// of their own.
    ///
    /// Sizes that cannot be aligned within a `u32` are an
    /// [`InvalidRange`](crate::Error::InvalidRange).
    pub fn alloc(&mut self, size: u32) -> Result<ScratchAlloc> {
        let size = size
            .max(1)
            .checked_next_multiple_of(ALIGNMENT)
            .ok_or(crate::Error::InvalidRange {
                offset: 0,
                size: u64::from(size),
            })?;
        if size > BLOCK_SIZE {
            let bo = self.screen.bo_create(size, 0)?;
            bo.update(true, true)?;
            log::debug!("scratch: dedicated {size:#x} byte buffer {}", bo.handle());
            return Self::carve(bo, 0, size);
        }
        if let Some((bo, used)) = &mut self.current {
            if *used + size <= BLOCK_SIZE {
                let offset = *used;
                *used += size;
                return Self::carve(bo.clone(), offset, size);
            }
        }
        let bo = self.next_block()?;
        if let Some((old, _)) = self.current.replace((bo.clone(), size)) {
            self.retired.push(old);
        }
        Self::carve(bo, 0, size)
    }

    fn carve(bo: Bo, offset: u32, size: u32) -> Result<ScratchAlloc> {
        let va = bo.va().ok_or(crate::Error::OutOfVaSpace)? + offset;
        Ok(ScratchAlloc {
            bo,
            offset,
            va,
            size,
        })
    }

    fn next_block(&mut self) -> Result<Bo> {
        if let Some(i) = self.retired.iter().position(|bo| bo.refcount() == 1) {
            return Ok(self.retired.swap_remove(i));
        }
        let bo = self.screen.bo_create(BLOCK_SIZE, 0)?;
        bo.update(true, true)?;
        log::debug!("scratch: new block {}", bo.handle());
        Ok(bo)
    }

    /// Ends the frame. Later allocations never share a block with earlier
    /// ones.
    pub fn reset(&mut self) {
        if let Some((bo, _)) = self.current.take() {
            self.retired.push(bo);
        }
        let mut idle = 0;
        self.retired.retain(|bo| {
            if bo.refcount() > 1 {
                return true;
            }
            idle += 1;
            idle <= MAX_IDLE_BLOCKS
        });
    }

    /// Number of blocks owned by the arena.
    #[cfg(test)]
    pub fn block_count(&self) -> usize {
        self.retired.len() + usize::from(self.current.is_some())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{ScratchArena, ScratchRole, ALIGNMENT, BLOCK_SIZE};
    use crate::sim::SimKernel;
    use crate::{Bo, BoAccess, Pipe, Screen, ScreenOptions};

    fn arena() -> (Arc<SimKernel>, ScratchArena) {
        let sim = Arc::new(SimKernel::mali400(1));
        let screen = Screen::new(sim.clone(), ScreenOptions::default()).unwrap();
        (sim, ScratchArena::new(screen))
    }

    #[test]
    fn allocations_are_aligned_and_packed() {
        let (_sim, mut arena) = arena();
        let a = arena.alloc(4).unwrap();
        let b = arena.alloc(100).unwrap();
        let c = arena.alloc(64).unwrap();
        assert!(Bo::ptr_eq(a.bo(), b.bo()) && Bo::ptr_eq(b.bo(), c.bo()));
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), ALIGNMENT);
        assert_eq!(c.offset(), 3 * ALIGNMENT);
        assert_eq!(c.va(), a.va() + c.offset());
        assert_eq!(arena.block_count(), 1);
    }

    #[test]
    fn full_blocks_roll_over() {
        let (_sim, mut arena) = arena();
        let a = arena.alloc(BLOCK_SIZE - ALIGNMENT).unwrap();
        let b = arena.alloc(2 * ALIGNMENT).unwrap();
        assert!(!Bo::ptr_eq(a.bo(), b.bo()));
        assert_eq!(b.offset(), 0);
        assert_eq!(arena.block_count(), 2);
    }

    #[test]
    fn large_allocations_are_dedicated() {
        let (_sim, mut arena) = arena();
        let big = arena.alloc(BLOCK_SIZE + 1).unwrap();
        assert!(big.bo().size() > BLOCK_SIZE);
        assert_eq!(arena.block_count(), 0);
    }

    #[test]
    fn unalignable_sizes_are_rejected() {
        let (sim, mut arena) = arena();
        let handles = sim.live_handles();
        for size in [u32::MAX, u32::MAX - ALIGNMENT + 2] {
            assert!(matches!(
                arena.alloc(size),
                Err(crate::Error::InvalidRange { .. })
            ));
        }
        assert_eq!(sim.live_handles(), handles);
        assert_eq!(arena.block_count(), 0);
    }

    #[test]
    fn idle_blocks_are_recycled() {
        let (_sim, mut arena) = arena();
        let handle = arena.alloc(16).unwrap().bo().handle();
        arena.reset();
        assert_eq!(arena.alloc(16).unwrap().bo().handle(), handle);
    }

    #[test]
    fn referenced_blocks_are_not_recycled() {
        let (_sim, mut arena) = arena();
        let held = arena.alloc(16).unwrap();
        arena.reset();
        let next = arena.alloc(16).unwrap();
        assert!(!Bo::ptr_eq(held.bo(), next.bo()));
        drop(held);
        arena.reset();
        assert_eq!(arena.block_count(), 2);
    }

    #[test]
    fn writes_land_in_the_range() {
        let (sim, mut arena) = arena();
        arena.alloc(8).unwrap();
        let alloc = arena.alloc(8).unwrap();
        alloc.write(&[1, 2, 3, 4]).unwrap();
        assert_eq!(sim.read_va(alloc.va(), 4).unwrap(), [1, 2, 3, 4]);
        assert!(alloc.write(&[0; 65]).is_err());
    }

    #[test]
    fn varyings_are_shared_between_pipes() {
        let usage = ScratchRole::GpVaryings.usage();
        assert!(usage.contains(&(Pipe::Gp, BoAccess::READ | BoAccess::WRITE)));
        assert!(usage.contains(&(Pipe::Pp, BoAccess::READ)));
        assert_eq!(
            ScratchRole::PpRenderState.usage(),
            &[(Pipe::Pp, BoAccess::READ)]
        );
    }
}
