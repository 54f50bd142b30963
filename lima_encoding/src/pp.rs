// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pixel processor render state.

use bytemuck::{Pod, Zeroable};

/// Blend equation, numbered as the hardware expects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum BlendFunc {
    Subtract = 0,
    ReverseSubtract = 1,
    #[default]
    Add = 2,
    Min = 4,
    Max = 5,
}

/// Blend factor, numbered as the hardware expects.
///
/// Dual-source factors have no hardware encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum BlendFactor {
    SrcColor = 0,
    DstColor = 1,
    ConstColor = 2,
    Zero = 3,
    SrcAlphaSaturate = 7,
    InvSrcColor = 8,
    InvDstColor = 9,
    InvConstColor = 10,
    One = 11,
    SrcAlpha = 16,
    DstAlpha = 17,
    ConstAlpha = 18,
    InvSrcAlpha = 24,
    InvDstAlpha = 25,
    InvConstAlpha = 26,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum StencilOp {
    #[default]
    Keep = 0,
    Replace = 1,
    Zero = 2,
    Invert = 3,
    IncrWrap = 4,
    DecrWrap = 5,
    Incr = 6,
    Decr = 7,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlendState {
    pub rgb_func: BlendFunc,
    pub alpha_func: BlendFunc,
    pub rgb_src: BlendFactor,
    pub rgb_dst: BlendFactor,
    pub alpha_src: BlendFactor,
    pub alpha_dst: BlendFactor,
    /// Constant blend color as RGBA.
    pub color: [f32; 4],
}

impl Default for BlendState {
    /// Source replaces destination.
    fn default() -> Self {
        Self {
            rgb_func: BlendFunc::Add,
            alpha_func: BlendFunc::Add,
            rgb_src: BlendFactor::One,
            rgb_dst: BlendFactor::Zero,
            alpha_src: BlendFactor::One,
            alpha_dst: BlendFactor::Zero,
            color: [0.0; 4],
        }
    }
}

impl BlendState {
    /// Standard non-premultiplied alpha blending.
    pub fn alpha() -> Self {
        Self {
            rgb_src: BlendFactor::SrcAlpha,
            rgb_dst: BlendFactor::InvSrcAlpha,
            alpha_src: BlendFactor::SrcAlpha,
            alpha_dst: BlendFactor::InvSrcAlpha,
            ..Self::default()
        }
    }

    pub fn alpha_blend_word(&self) -> u32 {
        // Alpha factors only have room for the low four bits.
        (self.rgb_func as u32)
            | ((self.alpha_func as u32) << 3)
            | ((self.rgb_src as u32) << 6)
            | ((self.rgb_dst as u32) << 11)
            | (((self.alpha_src as u32) & 0xF) << 16)
            | (((self.alpha_dst as u32) & 0xF) << 20)
            | 0xFC00_0000
    }

    /// Blue and green constant color channels.
    pub fn color_bg_word(&self) -> u32 {
        float_to_ubyte(self.color[2]) | (float_to_ubyte(self.color[1]) << 16)
    }

    /// Red and alpha constant color channels.
    pub fn color_ra_word(&self) -> u32 {
        float_to_ubyte(self.color[0]) | (float_to_ubyte(self.color[3]) << 16)
    }
}

/// Per-face stencil configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StencilFace {
    /// Comparison function, 0 (never) through 7 (always).
    pub func: u32,
    pub fail_op: StencilOp,
    pub zfail_op: StencilOp,
    pub zpass_op: StencilOp,
    pub ref_value: u8,
    pub value_mask: u8,
}

impl Default for StencilFace {
    fn default() -> Self {
        Self {
            func: 7,
            fail_op: StencilOp::Keep,
            zfail_op: StencilOp::Keep,
            zpass_op: StencilOp::Keep,
            ref_value: 0,
            value_mask: 0xFF,
        }
    }
}

impl StencilFace {
    pub fn word(&self) -> u32 {
        (self.func & 0x7)
            | ((self.fail_op as u32) << 3)
            | ((self.zfail_op as u32) << 6)
            | ((self.zpass_op as u32) << 9)
            | (u32::from(self.ref_value) << 16)
            | (u32::from(self.value_mask) << 24)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthRange {
    pub near: f32,
    pub far: f32,
}

impl Default for DepthRange {
    fn default() -> Self {
        Self {
            near: 0.0,
            far: 1.0,
        }
    }
}

impl DepthRange {
    pub fn word(&self) -> u32 {
        float_to_ushort(self.near) | (float_to_ushort(self.far) << 16)
    }
}

/// The 16-word render state block describing one draw to the PP.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct RenderState {
    pub blend_color_bg: u32,
    pub blend_color_ra: u32,
    pub alpha_blend: u32,
    pub depth_test: u32,
    pub depth_range: u32,
    pub stencil_front: u32,
    pub stencil_back: u32,
    pub stencil_test: u32,
    pub multi_sample: u32,
    pub shader_address: u32,
    pub varying_types: u32,
    pub uniforms_address: u32,
    pub textures_address: u32,
    pub aux0: u32,
    pub aux1: u32,
    pub varyings_address: u32,
}

impl RenderState {
    /// Render state running the fragment shader at `shader_va`.
    ///
    /// The low five bits of the shader address are taken from the first
    /// instruction word, which encodes the length of that instruction.
    pub fn new(shader_va: u32, first_word: u32) -> Self {
        Self {
            alpha_blend: BlendState::default().alpha_blend_word(),
            depth_test: 0x3E,
            depth_range: DepthRange::default().word(),
            stencil_front: StencilFace::default().word(),
            stencil_back: StencilFace::default().word(),
            multi_sample: 0xF807,
            shader_address: shader_va | (first_word & 0x1F),
            aux0: 0x300,
            aux1: 0x3000,
            ..Self::default()
        }
    }

    pub fn with_blend(mut self, blend: &BlendState) -> Self {
        self.blend_color_bg = blend.color_bg_word();
        self.blend_color_ra = blend.color_ra_word();
        self.alpha_blend = blend.alpha_blend_word();
        self
    }

    pub fn with_depth_range(mut self, range: DepthRange) -> Self {
        self.depth_range = range.word();
        self
    }

    pub fn with_stencil(mut self, front: &StencilFace, back: &StencilFace) -> Self {
        self.stencil_front = front.word();
        self.stencil_back = back.word();
        self
    }

    pub fn with_uniforms(mut self, va: u32) -> Self {
        self.uniforms_address = va;
        self
    }

    pub fn with_textures(mut self, va: u32) -> Self {
        self.textures_address = va;
        self
    }

    pub fn with_varyings(mut self, va: u32, types: u32) -> Self {
        self.varyings_address = va;
        self.varying_types = types;
        self
    }
}

fn float_to_ubyte(f: f32) -> u32 {
    (f.clamp(0.0, 1.0) * 255.0).round() as u32
}

fn float_to_ushort(f: f32) -> u32 {
    (f.clamp(0.0, 1.0) * 65535.0).round() as u32
}

static_assertions::const_assert_eq!(std::mem::size_of::<RenderState>(), 64);
