// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Rendering contexts.

use std::time::Duration;

use bitflags::bitflags;
use lima_encoding::{
    AttributeDescriptor, DepthRange, GpFrame, PpFrame, PpFrameRegs, PpWbRegs, RenderState,
    TileGeometry, VaryingDescriptor, MAX_PP, PLB_BLOCK_SIZE,
};

use crate::bo::Bo;
use crate::dump;
use crate::fence::Fence;
use crate::kernel::{BoAccess, Pipe};
use crate::packer::{CommandPacker, DrawInfo, DrawRecord, DrawState, VARYING_STRIDE};
use crate::plb::{PlbCache, PlbKey};
use crate::scratch::{ScratchAlloc, ScratchArena, ScratchRole};
use crate::screen::{DebugFlags, Screen};
use crate::submit::{KernelContext, SubmitQueue};
use crate::{Error, Result};

/// PLB blocks reserved per slot; geometries use at most `PLB_MAX_BLOCKS`.
const PLB_BLOCKS: u32 = 512;

/// Size of the tile heap the GP spills polygon lists into.
const TILE_HEAP_SIZE: u32 = 0x10_0000;

/// Bytes per pixel of a [`ColorTarget`].
const COLOR_CPP: u32 = 4;

/// How long preparing a buffer for CPU access waits for the GPU.
const CPU_ACCESS_TIMEOUT_NS: u64 = 1_000_000_000;

bitflags! {
    /// The buffers a clear applies to.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ClearFlags: u32 {
        const COLOR = 0x01;
        const DEPTH = 0x02;
        const STENCIL = 0x04;
    }
}

/// A linear RGBA8888 color buffer.
#[derive(Clone, Debug)]
pub struct ColorTarget {
    pub bo: Bo,
    pub width: u32,
    pub height: u32,
    /// Bytes per row, at least `width * 4`.
    pub stride: u32,
}

/// A render target registered with a [`Context`].
#[derive(Clone, Debug)]
pub struct Surface {
    color: ColorTarget,
    depth_stencil: Option<Bo>,
    geom: TileGeometry,
}

impl Surface {
    pub fn color(&self) -> &ColorTarget {
        &self.color
    }

    pub fn depth_stencil(&self) -> Option<&Bo> {
        self.depth_stencil.as_ref()
    }

    pub fn geometry(&self) -> &TileGeometry {
        &self.geom
    }

    fn same_target(&self, other: &Self) -> bool {
        Bo::ptr_eq(&self.color.bo, &other.color.bo) && self.geom == other.geom
    }
}

/// The fences of the two jobs a flush submits.
#[derive(Clone, Debug)]
pub struct FlushFences {
    pub gp: Fence,
    pub pp: Fence,
}

/// The memory one frame bins into: the PLB blocks, the table of their
/// addresses read by the PLBU, and the tile heap.
#[derive(Clone, Debug)]
struct PlbSlot {
    plb: Bo,
    plb_va: u32,
    plbu_array: Bo,
    plbu_array_va: u32,
    tile_heap: Bo,
    tile_heap_va: u32,
}

impl PlbSlot {
    fn new(screen: &Screen) -> Result<Self> {
        let plb = screen.bo_create(PLB_BLOCKS * PLB_BLOCK_SIZE, 0)?;
        plb.update(false, true)?;
        let plb_va = plb.va().ok_or(Error::OutOfVaSpace)?;

        let plbu_array = screen.bo_create(PLB_BLOCKS * 4, 0)?;
        plbu_array.update(true, true)?;
        let plbu_array_va = plbu_array.va().ok_or(Error::OutOfVaSpace)?;
        let blocks: Vec<u32> = (0..PLB_BLOCKS)
            .map(|i| plb_va + i * PLB_BLOCK_SIZE)
            .collect();
        plbu_array.write(0, bytemuck::cast_slice(&blocks))?;

        let tile_heap = screen.bo_create(TILE_HEAP_SIZE, 0)?;
        tile_heap.update(false, true)?;
        let tile_heap_va = tile_heap.va().ok_or(Error::OutOfVaSpace)?;
        Ok(Self {
            plb,
            plb_va,
            plbu_array,
            plbu_array_va,
            tile_heap,
            tile_heap_va,
        })
    }
}

/// Clear values of the current frame, as written to the PP frame registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ClearValues {
    color: u32,
    depth: u32,
    stencil: u32,
}

impl Default for ClearValues {
    fn default() -> Self {
        Self {
            color: 0,
            depth: 0x00FF_FFFF,
            stencil: 0,
        }
    }
}

fn pack_rgba8(color: [f32; 4]) -> u32 {
    color
        .iter()
        .enumerate()
        .map(|(i, c)| ((c.clamp(0.0, 1.0) * 255.0).round() as u32) << (i * 8))
        .fold(0, |acc, c| acc | c)
}

/// Converts a CPU-side length to a GPU size.
fn gpu_size(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::InvalidRange {
        offset: 0,
        size: len as u64,
    })
}

/// Byte offset of element `index` of an array at `base` with `stride`.
fn element_offset(base: u32, index: u32, stride: u32) -> Result<u32> {
    index
        .checked_mul(stride)
        .and_then(|offset| offset.checked_add(base))
        .ok_or(Error::InvalidRange {
            offset: u64::from(base) + u64::from(index) * u64::from(stride),
            size: u64::from(stride),
        })
}

/// Makes sure `bo` has a GPU address and returns the address of `offset`.
fn gpu_address(bo: &Bo, offset: u32) -> Result<u32> {
    if offset > bo.size() {
        return Err(Error::InvalidRange {
            offset: u64::from(offset),
            size: 0,
        });
    }
    bo.update(false, true)?;
    Ok(bo.va().ok_or(Error::OutOfVaSpace)? + offset)
}

/// A rendering context.
///
/// Owns a kernel context and one queue per pipe. Draws are accumulated until
/// [`Context::flush`] submits them as a GP job followed by a PP job. Frames
/// rotate through [`ScreenOptions::plb_slots`] sets of PLB memory so the GP
/// can bin a frame while the PP still renders the previous one.
///
/// [`ScreenOptions::plb_slots`]: crate::ScreenOptions::plb_slots
pub struct Context {
    // The queues go first so they drain before anything below is freed.
    gp: SubmitQueue,
    pp: SubmitQueue,
    screen: Screen,
    slots: Vec<PlbSlot>,
    slot: usize,
    plb_cache: PlbCache,
    packer: CommandPacker,
    scratch: ScratchArena,
    framebuffer: Option<Surface>,
    clear: ClearValues,
    /// The GP job of a flush whose PP job failed to submit, and the render
    /// state address it was built with.
    pending_gp: Option<(Fence, u32)>,
}

impl Context {
    pub(crate) fn new(screen: Screen) -> Result<Self> {
        let kctx = KernelContext::new(&screen.0)?;
        let slots = (0..screen.options().plb_slots.max(1))
            .map(|_| PlbSlot::new(&screen))
            .collect::<Result<Vec<_>>>()?;
        let num_pp = screen.info().num_pp as usize;
        Ok(Self {
            gp: SubmitQueue::new(kctx.clone(), Pipe::Gp),
            pp: SubmitQueue::new(kctx, Pipe::Pp),
            plb_cache: PlbCache::new(num_pp),
            packer: CommandPacker::new(),
            scratch: ScratchArena::new(screen.clone()),
            screen,
            slots,
            slot: 0,
            framebuffer: None,
            clear: ClearValues::default(),
            pending_gp: None,
        })
    }

    pub fn screen(&self) -> &Screen {
        &self.screen
    }

    /// Registers a render target, sharing tile streams with every other
    /// surface of the same tiled size.
    pub fn create_surface(
        &mut self,
        color: ColorTarget,
        depth_stencil: Option<Bo>,
    ) -> Result<Surface> {
        let geom = TileGeometry::try_new(color.width, color.height).ok_or(Error::InvalidRange {
            offset: 0,
            size: u64::from(color.width) * u64::from(color.height),
        })?;
        let row = u64::from(color.width) * u64::from(COLOR_CPP);
        if u64::from(color.stride) < row {
            return Err(Error::InvalidRange {
                offset: 0,
                size: u64::from(color.stride),
            });
        }
        let needed = u64::from(color.stride) * u64::from(color.height);
        let actual = u64::from(color.bo.size());
        if actual < needed {
            return Err(Error::ProtocolMismatch {
                expected: needed,
                actual,
            });
        }
        color.bo.update(false, true)?;
        if let Some(zs) = &depth_stencil {
            zs.update(false, true)?;
        }
        for slot in 0..self.slots.len() {
            self.plb_cache.register(PlbKey::new(slot, &geom));
        }
        Ok(Surface {
            color,
            depth_stencil,
            geom,
        })
    }

    /// Unregisters a surface. Pending work on it is flushed first.
    pub fn destroy_surface(&mut self, surface: Surface) -> Result<()> {
        if self
            .framebuffer
            .as_ref()
            .is_some_and(|fb| fb.same_target(&surface))
        {
            self.flush()?;
            self.framebuffer = None;
        }
        for slot in 0..self.slots.len() {
            self.plb_cache.unregister(PlbKey::new(slot, &surface.geom));
        }
        Ok(())
    }

    /// Binds the surface later draws render to. Work on a different surface
    /// is flushed first.
    pub fn set_framebuffer(&mut self, surface: Option<&Surface>) -> Result<()> {
        let changed = match (&self.framebuffer, surface) {
            (Some(old), Some(new)) => !old.same_target(new),
            (None, None) => false,
            _ => true,
        };
        if changed && self.packer.has_work() {
            self.flush()?;
        }
        self.framebuffer = surface.cloned();
        Ok(())
    }

    pub fn framebuffer(&self) -> Option<&Surface> {
        self.framebuffer.as_ref()
    }

    /// Sets the values the selected buffers are cleared to when the frame
    /// renders.
    pub fn clear(
        &mut self,
        flags: ClearFlags,
        color: [f32; 4],
        depth: f32,
        stencil: u8,
    ) -> Result<()> {
        self.begin_frame()?;
        if flags.contains(ClearFlags::COLOR) {
            self.clear.color = pack_rgba8(color);
        }
        if flags.contains(ClearFlags::DEPTH) {
            self.clear.depth = (depth.clamp(0.0, 1.0) * 0x00FF_FFFF as f32).round() as u32;
        }
        if flags.contains(ClearFlags::STENCIL) {
            self.clear.stencil = u32::from(stencil);
        }
        Ok(())
    }

    /// Makes sure the tile streams of the framebuffer exist for the current
    /// slot and starts the frame.
    ///
    /// The render targets join the PP job right away, so CPU access to them
    /// sees the pending frame.
    fn begin_frame(&mut self) -> Result<TileGeometry> {
        self.submit_pending()?;
        let fb = self.framebuffer.as_ref().ok_or(Error::NoFramebuffer)?;
        let geom = fb.geom;
        self.pp.add_bo(&fb.color.bo, BoAccess::WRITE)?;
        if let Some(zs) = &fb.depth_stencil {
            self.pp.add_bo(zs, BoAccess::WRITE)?;
        }
        let slot = &self.slots[self.slot];
        let key = PlbKey::new(self.slot, &geom);
        self.plb_cache
            .get_or_populate(&self.screen, key, &geom, slot.plb_va)?;
        self.packer.begin_frame(&geom, slot.plbu_array_va);
        Ok(geom)
    }

    /// Finishes a frame whose GP job was submitted by a failed flush.
    ///
    /// That frame's commands and scratch memory are already fixed, so new
    /// work cannot join it.
    fn submit_pending(&mut self) -> Result<()> {
        if self.pending_gp.is_some() {
            log::debug!("context: retrying the PP job of the previous flush");
            self.flush()?;
        }
        Ok(())
    }

    /// Allocates scratch memory for the current frame and adds it to the
    /// queues `role` is used by.
    pub fn scratch_alloc(&mut self, role: ScratchRole, size: u32) -> Result<ScratchAlloc> {
        self.submit_pending()?;
        let alloc = self.scratch.alloc(size)?;
        for &(pipe, access) in role.usage() {
            self.queue_mut(pipe).add_bo(alloc.bo(), access)?;
        }
        Ok(alloc)
    }

    fn upload(&mut self, role: ScratchRole, bytes: &[u8]) -> Result<ScratchAlloc> {
        let alloc = self.scratch_alloc(role, gpu_size(bytes.len())?)?;
        alloc.write(bytes)?;
        Ok(alloc)
    }

    /// Records a draw into the current frame.
    ///
    /// A draw whose scissor is empty still starts the frame, so the tile
    /// streams are built and the frame is flushed, but emits no commands.
    pub fn draw(&mut self, state: &DrawState, info: &DrawInfo) -> Result<()> {
        self.begin_frame()?;
        if state.scissor.is_some_and(|s| s.is_empty()) || info.count == 0 {
            log::debug!("context: skipping empty draw");
            return Ok(());
        }
        let indexed = info.index.is_some();

        let vs = &state.vs;
        let vs_va = gpu_address(&vs.bo, vs.offset)?;
        self.gp.add_bo(&vs.bo, BoAccess::READ)?;
        let fs = &state.fs;
        let fs_va = gpu_address(&fs.bo, fs.offset)?;
        self.pp.add_bo(&fs.bo, BoAccess::READ)?;

        let uniforms = if state.vs_uniforms.is_empty() {
            (0, 0)
        } else {
            let alloc = self.upload(ScratchRole::GpUniform, &state.vs_uniforms)?;
            (alloc.va(), gpu_size(state.vs_uniforms.len())?)
        };

        let mut attributes = Vec::with_capacity(state.attribs.len());
        for attrib in &state.attribs {
            // Array draws start at their first vertex; indexed draws address
            // vertices through the indices.
            let first = if indexed { 0 } else { info.start };
            let offset = element_offset(attrib.offset, first, attrib.stride)?;
            let address = gpu_address(&attrib.bo, offset)?;
            self.gp.add_bo(&attrib.bo, BoAccess::READ)?;
            attributes.push(AttributeDescriptor::new(
                address,
                attrib.stride,
                attrib.ty,
                attrib.components,
            ));
        }
        let attribute_count = gpu_size(attributes.len())?;
        let attribute_table =
            self.upload(ScratchRole::GpAttributeInfo, bytemuck::cast_slice(&attributes))?;

        let vertex_count = info.vertex_count();
        let varyings_size = vertex_count
            .checked_mul(VARYING_STRIDE)
            .ok_or(Error::InvalidRange {
                offset: 0,
                size: u64::from(vertex_count) * u64::from(VARYING_STRIDE),
            })?;
        let varyings = self.scratch_alloc(ScratchRole::GpVaryings, varyings_size)?;
        let position_va = varyings.va();
        let varying_table = self.upload(
            ScratchRole::GpVaryingInfo,
            bytemuck::bytes_of(&VaryingDescriptor::position(position_va)),
        )?;

        let indices = match &info.index {
            Some(index) => {
                let offset = element_offset(index.offset, info.start, index.size.bytes())?;
                let va = gpu_address(&index.bo, offset)?;
                self.gp.add_bo(&index.bo, BoAccess::READ)?;
                Some((va, index.size))
            }
            None => None,
        };

        let vp = state.viewport;
        let mut render_state = RenderState::new(fs_va, fs.first_word)
            .with_blend(&state.blend)
            .with_depth_range(DepthRange {
                near: vp.near,
                far: vp.far,
            })
            .with_stencil(&state.stencil[0], &state.stencil[1]);
        if !state.fs_uniforms.is_empty() {
            let block = self.upload(ScratchRole::PpUniform, &state.fs_uniforms)?;
            let array = self.upload(ScratchRole::PpUniformArray, &block.va().to_le_bytes())?;
            render_state = render_state.with_uniforms(array.va());
        }

        self.packer.push_draw(&DrawRecord {
            mode: info.mode,
            count: info.count,
            vertex_count,
            indices,
            uniforms,
            shader: (vs_va, vs.size),
            prefetch: vs.prefetch,
            attributes: (attribute_table.va(), attribute_count),
            varyings: varying_table.va(),
            position_va,
            viewport: vp,
            rasterizer: state.rasterizer,
            render_state,
        });
        Ok(())
    }

    /// Whether anything was drawn or cleared since the last flush.
    pub fn has_work(&self) -> bool {
        self.packer.has_work()
    }

    /// Submits the current frame.
    ///
    /// Returns `None` if there was nothing to submit. If submission fails the
    /// frame is kept, and calling `flush` again retries it; a GP job which
    /// was already accepted is not submitted twice.
    pub fn flush(&mut self) -> Result<Option<FlushFences>> {
        if !self.packer.has_work() {
            return Ok(None);
        }
        let fb = self.framebuffer.clone().ok_or(Error::NoFramebuffer)?;
        let geom = fb.geom;
        let slot = self.slots[self.slot].clone();
        let debug = self.screen.options().debug;
        self.gp.poll();
        self.pp.poll();

        let (gp_fence, render_address) = match self.pending_gp.clone() {
            Some(pending) => pending,
            None => {
                let render_address = if self.packer.render_states().is_empty() {
                    0
                } else {
                    let states = self.packer.render_states().to_vec();
                    self.upload(ScratchRole::PpRenderState, bytemuck::cast_slice(&states))?
                        .va()
                };
                let vs = self.packer.finish_vs();
                let plbu = self.packer.finish_plbu(render_address);
                let vs_cmd = self.upload(ScratchRole::GpVsCmd, bytemuck::cast_slice(&vs))?;
                let plbu_cmd = self.upload(ScratchRole::GpPlbuCmd, bytemuck::cast_slice(&plbu))?;
                let frame = GpFrame {
                    vs_cmd_start: vs_cmd.va(),
                    vs_cmd_end: vs_cmd.va() + gpu_size(vs.len() * 4)?,
                    plbu_cmd_start: plbu_cmd.va(),
                    plbu_cmd_end: plbu_cmd.va() + gpu_size(plbu.len() * 4)?,
                    tile_heap_start: slot.tile_heap_va,
                    tile_heap_end: slot.tile_heap_va + slot.tile_heap.size(),
                };
                if debug.contains(DebugFlags::DUMP) {
                    dump::gp_job(&frame, &vs, &plbu);
                }
                self.gp.add_bo(&slot.plb, BoAccess::WRITE)?;
                self.gp.add_bo(&slot.plbu_array, BoAccess::READ)?;
                self.gp.add_bo(&slot.tile_heap, BoAccess::READ | BoAccess::WRITE)?;
                self.gp.set_frame_payload(bytemuck::bytes_of(&frame));
                let fence = self.gp.start()?;
                self.pending_gp = Some((fence.clone(), render_address));
                (fence, render_address)
            }
        };

        let num_pp = self.screen.info().num_pp as usize;
        let key = PlbKey::new(self.slot, &geom);
        let entry = self
            .plb_cache
            .get_or_populate(&self.screen, key, &geom, slot.plb_va)?;
        let streams = entry.stream_addresses(num_pp);
        if let Some(bo) = &entry.bo {
            self.pp.add_bo(bo, BoAccess::READ)?;
        }
        self.pp.add_bo(&slot.plb, BoAccess::READ)?;

        let mut regs = PpFrameRegs::new(render_address, &geom);
        regs.set_clear_color([self.clear.color; 4]);
        regs.clear_value_depth = self.clear.depth;
        regs.clear_value_stencil = self.clear.stencil;
        let color_va = gpu_address(&fb.color.bo, 0)?;
        let frame = PpFrame {
            frame: regs,
            wb: [
                PpWbRegs::color(color_va, fb.color.stride),
                PpWbRegs::default(),
                PpWbRegs::default(),
            ],
            plbu_array_address: streams,
            fragment_stack_address: [0; MAX_PP],
            num_pp: num_pp as u32,
        };
        if debug.contains(DebugFlags::DUMP) {
            dump::pp_job(&frame, self.packer.render_states());
        }
        self.pp.set_frame_payload(bytemuck::bytes_of(&frame));
        let pp_fence = self.pp.start()?;

        log::debug!(
            "context: flushed {} draws on slot {}",
            self.packer.draw_count(),
            self.slot
        );
        self.pending_gp = None;
        self.end_frame();
        self.slot = (self.slot + 1) % self.slots.len();

        if debug.contains(DebugFlags::SYNC) {
            gp_fence.wait(None)?;
            pp_fence.wait(None)?;
        }
        Ok(Some(FlushFences {
            gp: gp_fence,
            pp: pp_fence,
        }))
    }

    fn end_frame(&mut self) {
        self.packer.reset();
        self.scratch.reset();
        self.clear = ClearValues::default();
    }

    /// Drops the current frame without submitting it.
    pub fn discard_frame(&mut self) {
        if self.pending_gp.take().is_some() {
            log::warn!("context: discarding a frame whose GP job already ran");
        }
        self.gp.discard();
        self.pp.discard();
        self.end_frame();
    }

    /// Prepares `bo` for CPU access.
    ///
    /// Unsubmitted work that conflicts with `access` is flushed, then the
    /// call waits for the GPU to finish with the buffer and maps it. Reads
    /// conflict with pending GPU writes; writes conflict with any pending
    /// GPU use.
    pub fn prepare_cpu_access(&mut self, bo: &Bo, access: BoAccess) -> Result<()> {
        let cpu_write = access.contains(BoAccess::WRITE);
        if self.needs_flush(bo, cpu_write) {
            log::debug!("context: flushing for CPU access to {}", bo.handle());
            self.flush()?;
        }
        bo.wait(access, CPU_ACCESS_TIMEOUT_NS, true)?;
        bo.update(true, false)
    }

    /// Whether unsubmitted work uses `bo` in a way that conflicts with a CPU
    /// read, or a CPU write if `cpu_write` is set.
    pub fn needs_flush(&self, bo: &Bo, cpu_write: bool) -> bool {
        Pipe::ALL
            .into_iter()
            .any(|pipe| self.queue(pipe).has_bo(bo, !cpu_write))
    }

    pub fn queue(&self, pipe: Pipe) -> &SubmitQueue {
        match pipe {
            Pipe::Gp => &self.gp,
            Pipe::Pp => &self.pp,
        }
    }

    pub fn queue_mut(&mut self, pipe: Pipe) -> &mut SubmitQueue {
        match pipe {
            Pipe::Gp => &mut self.gp,
            Pipe::Pp => &mut self.pp,
        }
    }

    pub fn plb_cache(&self) -> &PlbCache {
        &self.plb_cache
    }

    pub fn packer(&self) -> &CommandPacker {
        &self.packer
    }

    /// The PLB slot the next frame bins into.
    pub fn current_slot(&self) -> usize {
        self.slot
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Waits for every submitted job of this context.
    pub fn finish(&mut self, timeout: Option<Duration>) -> Result<()> {
        for pipe in Pipe::ALL {
            if let Some(fence) = self.queue(pipe).last_fence() {
                fence.wait(timeout)?;
            }
            self.queue_mut(pipe).poll();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("gp", &self.gp)
            .field("pp", &self.pp)
            .field("slot", &self.slot)
            .field("slots", &self.slots.len())
            .field("has_work", &self.packer.has_work())
            .finish_non_exhaustive()
    }
}
