// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Accumulation of draws into GP command streams and PP render states.

use lima_encoding::{
    AttribType, BlendState, CullMode, DrawMode, IndexSize, PlbuCmd, RenderState, StencilFace,
    TileGeometry, VsCmd,
};

use crate::bo::Bo;

/// Bytes of varying output per vertex, a vec4 of floats for the position.
pub(crate) const VARYING_STRIDE: u32 = 16;

/// A compiled vertex shader placed in a buffer.
#[derive(Clone, Debug)]
pub struct VertexShader {
    pub bo: Bo,
    pub offset: u32,
    /// Size of the program in bytes.
    pub size: u32,
    /// Instruction prefetch count reported by the compiler.
    pub prefetch: u32,
}

/// A compiled fragment shader placed in a buffer.
#[derive(Clone, Debug)]
pub struct FragmentShader {
    pub bo: Bo,
    /// Must be 32 byte aligned; the low bits of the address hold the length
    /// of the first instruction.
    pub offset: u32,
    pub size: u32,
    /// The first word of the program.
    pub first_word: u32,
}

/// One vertex attribute stream.
#[derive(Clone, Debug)]
pub struct VertexAttrib {
    pub bo: Bo,
    pub offset: u32,
    pub stride: u32,
    pub ty: AttribType,
    /// Components per vertex, 1 to 4.
    pub components: u32,
}

#[derive(Clone, Debug)]
pub struct IndexBuffer {
    pub bo: Bo,
    pub offset: u32,
    pub size: IndexSize,
    /// Largest index used by the draw.
    pub max_index: u32,
}

/// The viewport rectangle in pixels and the depth range.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub near: f32,
    pub far: f32,
}

impl Viewport {
    /// The viewport covering a whole `width` by `height` framebuffer.
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width,
            height,
            near: 0.0,
            far: 1.0,
        }
    }

    /// Recovers the rectangle and depth range from a viewport transform,
    /// which maps clip coordinates as `ndc * scale + translate`.
    pub fn from_scale_translate(scale: [f32; 3], translate: [f32; 3]) -> Self {
        Self {
            x: translate[0] - scale[0],
            y: (translate[1] - scale[1].abs()).abs(),
            width: scale[0] * 2.0,
            height: (scale[1] * 2.0).abs(),
            near: translate[2] - scale[2],
            far: translate[2] + scale[2],
        }
    }
}

/// A scissor rectangle, `min` inclusive and `max` exclusive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Scissor {
    pub minx: u32,
    pub miny: u32,
    pub maxx: u32,
    pub maxy: u32,
}

impl Scissor {
    /// Whether no pixel passes the scissor.
    pub fn is_empty(&self) -> bool {
        self.maxx <= self.minx || self.maxy <= self.miny
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rasterizer {
    pub cull: CullMode,
    /// Whether counter-clockwise triangles are front facing.
    pub front_ccw: bool,
}

impl Default for Rasterizer {
    fn default() -> Self {
        Self {
            cull: CullMode::None,
            front_ccw: true,
        }
    }
}

/// Everything a draw reads besides its vertex range.
#[derive(Clone, Debug)]
pub struct DrawState {
    pub vs: VertexShader,
    pub fs: FragmentShader,
    pub attribs: Vec<VertexAttrib>,
    /// Vertex shader uniforms, copied into the frame at draw time.
    pub vs_uniforms: Vec<u8>,
    /// Fragment shader uniforms, copied into the frame at draw time.
    pub fs_uniforms: Vec<u8>,
    pub viewport: Viewport,
    pub scissor: Option<Scissor>,
    pub rasterizer: Rasterizer,
    pub blend: BlendState,
    /// Front and back stencil state.
    pub stencil: [StencilFace; 2],
}

impl DrawState {
    /// State with no attributes, no uniforms, no scissor, no culling and
    /// replacing blend.
    pub fn new(vs: VertexShader, fs: FragmentShader, viewport: Viewport) -> Self {
        Self {
            vs,
            fs,
            attribs: Vec::new(),
            vs_uniforms: Vec::new(),
            fs_uniforms: Vec::new(),
            viewport,
            scissor: None,
            rasterizer: Rasterizer::default(),
            blend: BlendState::default(),
            stencil: [StencilFace::default(); 2],
        }
    }
}

/// The primitives of one draw.
#[derive(Clone, Debug)]
pub struct DrawInfo {
    pub mode: DrawMode,
    /// First vertex, or first index for indexed draws.
    pub start: u32,
    /// Number of vertices, or of indices for indexed draws.
    pub count: u32,
    pub index: Option<IndexBuffer>,
}

impl DrawInfo {
    pub fn arrays(mode: DrawMode, start: u32, count: u32) -> Self {
        Self {
            mode,
            start,
            count,
            index: None,
        }
    }

    pub fn indexed(mode: DrawMode, start: u32, count: u32, index: IndexBuffer) -> Self {
        Self {
            mode,
            start,
            count,
            index: Some(index),
        }
    }

    /// Number of vertices the vertex shader runs on.
    pub fn vertex_count(&self) -> u32 {
        match &self.index {
            Some(index) => index.max_index.saturating_add(1),
            None => self.count,
        }
    }
}

/// A draw with every buffer resolved to a GPU address.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DrawRecord {
    pub mode: DrawMode,
    pub count: u32,
    pub vertex_count: u32,
    /// Address of the first index and the index size, for indexed draws.
    pub indices: Option<(u32, IndexSize)>,
    pub uniforms: (u32, u32),
    pub shader: (u32, u32),
    pub prefetch: u32,
    pub attributes: (u32, u32),
    pub varyings: u32,
    /// Where the vertex shader writes positions.
    pub position_va: u32,
    pub viewport: Viewport,
    pub rasterizer: Rasterizer,
    pub render_state: RenderState,
}

/// Per-frame GP command streams and PP render states.
///
/// The PLBU stream refers to render states by address, which is only known
/// once the render states are uploaded at flush. Those words hold an offset
/// into the render state array until [`CommandPacker::finish_plbu`] relocates
/// them.
#[derive(Debug, Default)]
pub struct CommandPacker {
    vs_cmd: Vec<u32>,
    plbu_cmd: Vec<u32>,
    render_states: Vec<RenderState>,
    /// Indices of PLBU words holding a render state offset.
    relocs: Vec<usize>,
    has_work: bool,
}

impl CommandPacker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a frame on `geom`, binning into the PLB whose block address
    /// array is at `plbu_array_va`. Does nothing if the frame has started.
    pub fn begin_frame(&mut self, geom: &TileGeometry, plbu_array_va: u32) {
        self.has_work = true;
        if !self.plbu_cmd.is_empty() {
            return;
        }
        let out = &mut self.plbu_cmd;
        PlbuCmd::PrimitiveSetup {
            draw: false,
            cull_cw: false,
            cull_ccw: false,
            index16: false,
        }
        .push(out);
        PlbuCmd::BlockStep {
            shift_max: geom.shift_max,
            shift_h: geom.shift_h,
            shift_w: geom.shift_w,
        }
        .push(out);
        PlbuCmd::TiledDimensions {
            tiled_w: geom.tiled_w,
            tiled_h: geom.tiled_h,
        }
        .push(out);
        PlbuCmd::BlockStride(geom.block_w).push(out);
        PlbuCmd::ArrayAddress {
            va: plbu_array_va,
            block_count: geom.block_count(),
        }
        .push(out);
    }

    pub(crate) fn push_draw(&mut self, draw: &DrawRecord) {
        let indexed = draw.indices.is_some();
        self.pack_vs(draw, indexed);
        self.pack_plbu(draw, indexed);
        self.render_states.push(draw.render_state);
    }

    fn pack_vs(&mut self, draw: &DrawRecord, indexed: bool) {
        let out = &mut self.vs_cmd;
        if !indexed {
            VsCmd::ArraysSemaphore(VsCmd::SEMAPHORE_BEGIN_1).push(out);
            VsCmd::ArraysSemaphore(VsCmd::SEMAPHORE_BEGIN_2).push(out);
        }
        let (uniforms_va, uniforms_size) = draw.uniforms;
        VsCmd::UniformsAddress {
            va: uniforms_va,
            size: uniforms_size.next_multiple_of(16),
        }
        .push(out);
        let (shader_va, shader_size) = draw.shader;
        VsCmd::ShaderAddress {
            va: shader_va,
            size: shader_size,
        }
        .push(out);
        VsCmd::ShaderInfo {
            prefetch: draw.prefetch,
            size: shader_size,
        }
        .push(out);
        let (attributes_va, attribute_count) = draw.attributes;
        VsCmd::VaryingAttributeCount {
            varyings: 1,
            attributes: attribute_count.max(1),
        }
        .push(out);
        VsCmd::Unknown41(3).push(out);
        VsCmd::AttributesAddress {
            va: attributes_va,
            count: attribute_count,
        }
        .push(out);
        VsCmd::VaryingsAddress {
            va: draw.varyings,
            count: 1,
        }
        .push(out);
        VsCmd::Draw {
            count: draw.vertex_count,
            indexed,
        }
        .push(out);
        VsCmd::Flush.push(out);
        let semaphore = if indexed {
            VsCmd::SEMAPHORE_NEXT
        } else {
            VsCmd::SEMAPHORE_END
        };
        VsCmd::ArraysSemaphore(semaphore).push(out);
    }

    fn pack_plbu(&mut self, draw: &DrawRecord, indexed: bool) {
        let rsw_offset = (self.render_states.len() * size_of::<RenderState>()) as u32;
        let out = &mut self.plbu_cmd;
        let vp = &draw.viewport;
        PlbuCmd::ViewportX(vp.x).push(out);
        PlbuCmd::ViewportW(vp.width).push(out);
        PlbuCmd::ViewportY(vp.y).push(out);
        PlbuCmd::ViewportH(vp.height).push(out);
        if !indexed {
            PlbuCmd::ArraysSemaphore(PlbuCmd::SEMAPHORE_BEGIN).push(out);
        }
        let (cull_cw, cull_ccw) = draw.rasterizer.cull.windings(draw.rasterizer.front_ccw);
        PlbuCmd::PrimitiveSetup {
            draw: true,
            cull_cw,
            cull_ccw,
            index16: matches!(draw.indices, Some((_, IndexSize::U16))),
        }
        .push(out);
        self.relocs.push(out.len());
        PlbuCmd::RswVertexArray {
            rsw_va: rsw_offset,
            position_va: draw.position_va,
        }
        .push(out);
        PlbuCmd::Unknown10A(0).push(out);
        PlbuCmd::DepthRangeNear(vp.near).push(out);
        PlbuCmd::DepthRangeFar(vp.far).push(out);
        let primitives = PlbuCmd::Draw {
            mode: draw.mode,
            start: 0,
            count: draw.count,
            indexed,
        };
        match draw.indices {
            Some((indices_va, _)) => {
                PlbuCmd::IndexedDest(draw.position_va).push(out);
                PlbuCmd::Indices(indices_va).push(out);
            }
            None => primitives.push(out),
        }
        PlbuCmd::ArraysSemaphore(PlbuCmd::SEMAPHORE_END).push(out);
        if indexed {
            primitives.push(out);
        }
    }

    /// Whether anything was drawn or cleared since the last reset.
    pub fn has_work(&self) -> bool {
        self.has_work
    }

    pub fn draw_count(&self) -> usize {
        self.render_states.len()
    }

    pub fn vs_words(&self) -> &[u32] {
        &self.vs_cmd
    }

    /// The PLBU stream so far, with unrelocated render state offsets.
    pub fn plbu_words(&self) -> &[u32] {
        &self.plbu_cmd
    }

    pub fn render_states(&self) -> &[RenderState] {
        &self.render_states
    }

    /// The VS stream as submitted.
    pub fn finish_vs(&self) -> Vec<u32> {
        self.vs_cmd.clone()
    }

    /// The PLBU stream as submitted, with render states at `rsw_va` and the
    /// end marker appended.
    ///
    /// The packer is left untouched, so a failed submission can be retried.
    pub fn finish_plbu(&self, rsw_va: u32) -> Vec<u32> {
        let mut words = Vec::with_capacity(self.plbu_cmd.len() + 2);
        words.extend_from_slice(&self.plbu_cmd);
        for &at in &self.relocs {
            words[at] += rsw_va;
        }
        PlbuCmd::End.push(&mut words);
        words
    }

    /// Forgets the frame.
    pub fn reset(&mut self) {
        self.vs_cmd.clear();
        self.plbu_cmd.clear();
        self.render_states.clear();
        self.relocs.clear();
        self.has_work = false;
    }
}
