// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Geometry processor command words.
//!
//! Both GP units (the vertex shader unit and the PLBU) consume a stream of
//! 64-bit commands, written as two little-endian 32-bit words. The second
//! word carries the opcode in its high bits; the first is the operand.

use crate::fui;

const VS_SEMAPHORE: u32 = 0x5000_0000;
const VS_UNIFORMS_ADDRESS: u32 = 0x3000_0000;
const VS_UNIFORMS_SIZE_SHIFT: u32 = 12;
const VS_SHADER_ADDRESS: u32 = 0x4000_0000;
const VS_SHADER_SIZE_SHIFT: u32 = 16;
const VS_SHADER_INFO: u32 = 0x1000_0040;
const VS_SHADER_PREFETCH_SHIFT: u32 = 20;
const VS_SHADER_LINES_SHIFT: u32 = 10;
const VS_SHADER_LINES_MASK: u32 = 0x3FF;
const VS_VARYING_ATTRIBUTE_COUNT: u32 = 0x1000_0042;
const VS_UNKNOWN_41: u32 = 0x1000_0041;
const VS_ATTRIBUTES_ADDRESS: u32 = 0x2000_0000;
const VS_VARYINGS_ADDRESS: u32 = 0x2000_0008;
const VS_ADDRESS_COUNT_SHIFT: u32 = 17;
const VS_FLUSH: u32 = 0x6000_0000;

const PLBU_REG: u32 = 0x1000_0000;
const PLBU_REG_INDEXED_DEST: u32 = 0x100;
const PLBU_REG_INDICES: u32 = 0x101;
const PLBU_REG_VIEWPORT_Y: u32 = 0x105;
const PLBU_REG_VIEWPORT_H: u32 = 0x106;
const PLBU_REG_VIEWPORT_X: u32 = 0x107;
const PLBU_REG_VIEWPORT_W: u32 = 0x108;
const PLBU_REG_TILED_DIMENSIONS: u32 = 0x109;
const PLBU_REG_UNKNOWN_10A: u32 = 0x10A;
const PLBU_REG_PRIMITIVE_SETUP: u32 = 0x10B;
const PLBU_REG_BLOCK_STEP: u32 = 0x10C;
const PLBU_REG_DEPTH_NEAR: u32 = 0x10E;
const PLBU_REG_DEPTH_FAR: u32 = 0x10F;
const PLBU_BLOCK_STRIDE: u32 = 0x3000_0000;
const PLBU_ARRAY_ADDRESS: u32 = 0x2800_0000;
const PLBU_SEMAPHORE: u32 = 0x6000_0000;
const PLBU_RSW_VERTEX_ARRAY: u32 = 0x8000_0000;
const PLBU_END: u32 = 0x5000_0000;
const PLBU_DRAW_ELEMENTS: u32 = 0x0020_0000;
const PLBU_DRAW_MODE_SHIFT: u32 = 16;
const PLBU_DRAW_MODE_MASK: u32 = 0x1F;

const OPCODE_MASK: u32 = 0xF000_0000;

const PRIM_ALWAYS: u32 = 0x0000_0200;
const PRIM_DRAW: u32 = 0x0000_2000;
const PRIM_INDEX16: u32 = 0x0000_0400;
const PRIM_CULL_CW: u32 = 0x0002_0000;
const PRIM_CULL_CCW: u32 = 0x0004_0000;

/// Primitive topology, numbered as the hardware expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum DrawMode {
    Points = 0,
    Lines = 1,
    LineLoop = 2,
    LineStrip = 3,
    Triangles = 4,
    TriangleStrip = 5,
    TriangleFan = 6,
}

impl DrawMode {
    fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits {
            0 => Self::Points,
            1 => Self::Lines,
            2 => Self::LineLoop,
            3 => Self::LineStrip,
            4 => Self::Triangles,
            5 => Self::TriangleStrip,
            6 => Self::TriangleFan,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexSize {
    U8,
    U16,
}

impl IndexSize {
    pub fn bytes(self) -> u32 {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
    FrontAndBack,
}

impl CullMode {
    /// Resolves which windings to cull as `(cw, ccw)`.
    pub fn windings(self, front_ccw: bool) -> (bool, bool) {
        let (front, back) = match self {
            Self::None => (false, false),
            Self::Front => (true, false),
            Self::Back => (false, true),
            Self::FrontAndBack => (true, true),
        };
        let cull_ccw = (front && front_ccw) || (back && !front_ccw);
        let cull_cw = (front && !front_ccw) || (back && front_ccw);
        (cull_cw, cull_ccw)
    }
}

/// A command for the vertex shader unit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum VsCmd {
    /// Synchronizes with the PLBU around array draws.
    ArraysSemaphore(u32),
    UniformsAddress { va: u32, size: u32 },
    ShaderAddress { va: u32, size: u32 },
    ShaderInfo { prefetch: u32, size: u32 },
    VaryingAttributeCount { varyings: u32, attributes: u32 },
    /// Always written with 3 before the address commands.
    Unknown41(u32),
    AttributesAddress { va: u32, count: u32 },
    VaryingsAddress { va: u32, count: u32 },
    Draw { count: u32, indexed: bool },
    Flush,
}

impl VsCmd {
    pub const SEMAPHORE_BEGIN_1: u32 = 0x0002_8000;
    pub const SEMAPHORE_BEGIN_2: u32 = 0x0000_0001;
    pub const SEMAPHORE_NEXT: u32 = 0x0001_8000;
    pub const SEMAPHORE_END: u32 = 0x0000_0000;

    pub fn encode(self) -> [u32; 2] {
        match self {
            Self::ArraysSemaphore(value) => [value, VS_SEMAPHORE],
            Self::UniformsAddress { va, size } => {
                [va, VS_UNIFORMS_ADDRESS | (size << VS_UNIFORMS_SIZE_SHIFT)]
            }
            Self::ShaderAddress { va, size } => {
                [va, VS_SHADER_ADDRESS | ((size >> 4) << VS_SHADER_SIZE_SHIFT)]
            }
            Self::ShaderInfo { prefetch, size } => {
                let lines = size.div_ceil(16) - 1;
                [
                    (prefetch << VS_SHADER_PREFETCH_SHIFT) | (lines << VS_SHADER_LINES_SHIFT),
                    VS_SHADER_INFO,
                ]
            }
            Self::VaryingAttributeCount {
                varyings,
                attributes,
            } => [
                ((varyings - 1) << 8) | ((attributes - 1) << 24),
                VS_VARYING_ATTRIBUTE_COUNT,
            ],
            Self::Unknown41(value) => [value, VS_UNKNOWN_41],
            Self::AttributesAddress { va, count } => {
                [va, VS_ATTRIBUTES_ADDRESS | (count << VS_ADDRESS_COUNT_SHIFT)]
            }
            Self::VaryingsAddress { va, count } => {
                [va, VS_VARYINGS_ADDRESS | (count << VS_ADDRESS_COUNT_SHIFT)]
            }
            Self::Draw { count, indexed } => [(count << 24) | u32::from(indexed), count >> 8],
            Self::Flush => [0, VS_FLUSH],
        }
    }

    /// Appends the encoded command to a word stream.
    pub fn push(self, out: &mut Vec<u32>) {
        out.extend_from_slice(&self.encode());
    }

    pub fn decode(words: [u32; 2]) -> Option<Self> {
        let [w0, w1] = words;
        Some(match w1 {
            VS_SEMAPHORE => Self::ArraysSemaphore(w0),
            VS_SHADER_INFO => Self::ShaderInfo {
                prefetch: w0 >> VS_SHADER_PREFETCH_SHIFT,
                size: (((w0 >> VS_SHADER_LINES_SHIFT) & VS_SHADER_LINES_MASK) + 1) * 16,
            },
            VS_VARYING_ATTRIBUTE_COUNT => Self::VaryingAttributeCount {
                varyings: ((w0 >> 8) & 0xFF) + 1,
                attributes: (w0 >> 24) + 1,
            },
            VS_UNKNOWN_41 => Self::Unknown41(w0),
            VS_FLUSH => Self::Flush,
            _ => match w1 & OPCODE_MASK {
                VS_UNIFORMS_ADDRESS => Self::UniformsAddress {
                    va: w0,
                    size: (w1 & !OPCODE_MASK) >> VS_UNIFORMS_SIZE_SHIFT,
                },
                VS_SHADER_ADDRESS => Self::ShaderAddress {
                    va: w0,
                    size: ((w1 & !OPCODE_MASK) >> VS_SHADER_SIZE_SHIFT) << 4,
                },
                VS_ATTRIBUTES_ADDRESS if w1 & 0xF == 0x8 => Self::VaryingsAddress {
                    va: w0,
                    count: (w1 & !OPCODE_MASK) >> VS_ADDRESS_COUNT_SHIFT,
                },
                VS_ATTRIBUTES_ADDRESS => Self::AttributesAddress {
                    va: w0,
                    count: (w1 & !OPCODE_MASK) >> VS_ADDRESS_COUNT_SHIFT,
                },
                0 => Self::Draw {
                    count: (w0 >> 24) | (w1 << 8),
                    indexed: w0 & 1 != 0,
                },
                _ => return None,
            },
        })
    }
}

/// A command for the polygon list builder unit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PlbuCmd {
    PrimitiveSetup {
        /// Set on the per-draw setup, clear on the frame header.
        draw: bool,
        cull_cw: bool,
        cull_ccw: bool,
        index16: bool,
    },
    BlockStep { shift_max: u32, shift_h: u32, shift_w: u32 },
    TiledDimensions { tiled_w: u32, tiled_h: u32 },
    BlockStride(u32),
    ArrayAddress { va: u32, block_count: u32 },
    ViewportX(f32),
    ViewportY(f32),
    ViewportW(f32),
    ViewportH(f32),
    ArraysSemaphore(u32),
    RswVertexArray { rsw_va: u32, position_va: u32 },
    /// Always written with 0 after the render state.
    Unknown10A(u32),
    DepthRangeNear(f32),
    DepthRangeFar(f32),
    IndexedDest(u32),
    Indices(u32),
    Draw {
        mode: DrawMode,
        start: u32,
        count: u32,
        indexed: bool,
    },
    End,
}

impl PlbuCmd {
    pub const SEMAPHORE_BEGIN: u32 = 0x0001_0002;
    pub const SEMAPHORE_END: u32 = 0x0001_0001;

    pub fn encode(self) -> [u32; 2] {
        let reg = |reg: u32, value: u32| [value, PLBU_REG | reg];
        match self {
            Self::PrimitiveSetup {
                draw,
                cull_cw,
                cull_ccw,
                index16,
            } => {
                let mut bits = PRIM_ALWAYS;
                if draw {
                    bits |= PRIM_DRAW;
                }
                if cull_cw {
                    bits |= PRIM_CULL_CW;
                }
                if cull_ccw {
                    bits |= PRIM_CULL_CCW;
                }
                if index16 {
                    bits |= PRIM_INDEX16;
                }
                reg(PLBU_REG_PRIMITIVE_SETUP, bits)
            }
            Self::BlockStep {
                shift_max,
                shift_h,
                shift_w,
            } => reg(
                PLBU_REG_BLOCK_STEP,
                (shift_max << 28) | (shift_h << 16) | shift_w,
            ),
            Self::TiledDimensions { tiled_w, tiled_h } => reg(
                PLBU_REG_TILED_DIMENSIONS,
                ((tiled_w - 1) << 24) | ((tiled_h - 1) << 8),
            ),
            Self::BlockStride(block_w) => [block_w, PLBU_BLOCK_STRIDE],
            Self::ArrayAddress { va, block_count } => [va, PLBU_ARRAY_ADDRESS | (block_count - 1)],
            Self::ViewportX(v) => reg(PLBU_REG_VIEWPORT_X, fui(v)),
            Self::ViewportY(v) => reg(PLBU_REG_VIEWPORT_Y, fui(v)),
            Self::ViewportW(v) => reg(PLBU_REG_VIEWPORT_W, fui(v)),
            Self::ViewportH(v) => reg(PLBU_REG_VIEWPORT_H, fui(v)),
            Self::ArraysSemaphore(value) => [value, PLBU_SEMAPHORE],
            Self::RswVertexArray {
                rsw_va,
                position_va,
            } => [rsw_va, PLBU_RSW_VERTEX_ARRAY | (position_va >> 4)],
            Self::Unknown10A(value) => reg(PLBU_REG_UNKNOWN_10A, value),
            Self::DepthRangeNear(v) => reg(PLBU_REG_DEPTH_NEAR, fui(v)),
            Self::DepthRangeFar(v) => reg(PLBU_REG_DEPTH_FAR, fui(v)),
            Self::IndexedDest(va) => reg(PLBU_REG_INDEXED_DEST, va),
            Self::Indices(va) => reg(PLBU_REG_INDICES, va),
            Self::Draw {
                mode,
                start,
                count,
                indexed,
            } => {
                let elements = if indexed { PLBU_DRAW_ELEMENTS } else { 0 };
                [
                    (count << 24) | start,
                    elements
                        | (((mode as u32) & PLBU_DRAW_MODE_MASK) << PLBU_DRAW_MODE_SHIFT)
                        | (count >> 8),
                ]
            }
            Self::End => [0, PLBU_END],
        }
    }

    /// Appends the encoded command to a word stream.
    pub fn push(self, out: &mut Vec<u32>) {
        out.extend_from_slice(&self.encode());
    }

    pub fn decode(words: [u32; 2]) -> Option<Self> {
        let [w0, w1] = words;
        let f = f32::from_bits;
        Some(match w1 & OPCODE_MASK {
            PLBU_REG => match w1 & !OPCODE_MASK {
                PLBU_REG_PRIMITIVE_SETUP => Self::PrimitiveSetup {
                    draw: w0 & PRIM_DRAW != 0,
                    cull_cw: w0 & PRIM_CULL_CW != 0,
                    cull_ccw: w0 & PRIM_CULL_CCW != 0,
                    index16: w0 & PRIM_INDEX16 != 0,
                },
                PLBU_REG_BLOCK_STEP => Self::BlockStep {
                    shift_max: w0 >> 28,
                    shift_h: (w0 >> 16) & 0xFFF,
                    shift_w: w0 & 0xFFFF,
                },
                PLBU_REG_TILED_DIMENSIONS => Self::TiledDimensions {
                    tiled_w: (w0 >> 24) + 1,
                    tiled_h: ((w0 >> 8) & 0xFFFF) + 1,
                },
                PLBU_REG_VIEWPORT_X => Self::ViewportX(f(w0)),
                PLBU_REG_VIEWPORT_Y => Self::ViewportY(f(w0)),
                PLBU_REG_VIEWPORT_W => Self::ViewportW(f(w0)),
                PLBU_REG_VIEWPORT_H => Self::ViewportH(f(w0)),
                PLBU_REG_UNKNOWN_10A => Self::Unknown10A(w0),
                PLBU_REG_DEPTH_NEAR => Self::DepthRangeNear(f(w0)),
                PLBU_REG_DEPTH_FAR => Self::DepthRangeFar(f(w0)),
                PLBU_REG_INDEXED_DEST => Self::IndexedDest(w0),
                PLBU_REG_INDICES => Self::Indices(w0),
                _ => return None,
            },
            PLBU_BLOCK_STRIDE => Self::BlockStride(w0),
            0x2000_0000 if w1 & 0xF800_0000 == PLBU_ARRAY_ADDRESS => Self::ArrayAddress {
                va: w0,
                block_count: (w1 & 0x07FF_FFFF) + 1,
            },
            PLBU_SEMAPHORE => Self::ArraysSemaphore(w0),
            PLBU_RSW_VERTEX_ARRAY => Self::RswVertexArray {
                rsw_va: w0,
                position_va: (w1 & !OPCODE_MASK) << 4,
            },
            PLBU_END => Self::End,
            0 => Self::Draw {
                mode: DrawMode::from_bits((w1 >> PLBU_DRAW_MODE_SHIFT) & PLBU_DRAW_MODE_MASK)?,
                start: w0 & 0x00FF_FFFF,
                count: (w0 >> 24) | ((w1 & 0xFFFF) << 8),
                indexed: w1 & PLBU_DRAW_ELEMENTS != 0,
            },
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{CullMode, DrawMode, PlbuCmd, VsCmd};

    #[test]
    fn vs_words_match_hardware_layout() {
        assert_eq!(
            VsCmd::UniformsAddress { va: 0x100, size: 48 }.encode(),
            [0x100, 0x3003_0000]
        );
        assert_eq!(
            VsCmd::ShaderAddress { va: 0x200, size: 64 }.encode(),
            [0x200, 0x4004_0000]
        );
        // 40 bytes round up to three 16-byte instructions.
        assert_eq!(
            VsCmd::ShaderInfo { prefetch: 3, size: 40 }.encode(),
            [(3 << 20) | (2 << 10), 0x1000_0040]
        );
        assert_eq!(
            VsCmd::VaryingAttributeCount {
                varyings: 1,
                attributes: 2
            }
            .encode(),
            [1 << 24, 0x1000_0042]
        );
        assert_eq!(
            VsCmd::VaryingsAddress { va: 0x300, count: 1 }.encode(),
            [0x300, 0x2002_0008]
        );
        assert_eq!(
            VsCmd::Draw {
                count: 0x1234,
                indexed: false
            }
            .encode(),
            [0x3400_0000, 0x12]
        );
    }

    #[test]
    fn vs_decode_distinguishes_address_commands() {
        let attrs = VsCmd::AttributesAddress { va: 8, count: 3 };
        let varyings = VsCmd::VaryingsAddress { va: 8, count: 3 };
        assert_eq!(VsCmd::decode(attrs.encode()), Some(attrs));
        assert_eq!(VsCmd::decode(varyings.encode()), Some(varyings));
    }

    #[test]
    fn plbu_draw_packs_count_across_words() {
        let draw = PlbuCmd::Draw {
            mode: DrawMode::Triangles,
            start: 6,
            count: 300,
            indexed: false,
        };
        let words = draw.encode();
        assert_eq!(words, [0x2C00_0006, (4 << 16) | 1]);
        assert_eq!(PlbuCmd::decode(words), Some(draw));

        let indexed = PlbuCmd::Draw {
            mode: DrawMode::TriangleStrip,
            start: 0,
            count: 4,
            indexed: true,
        };
        assert_eq!(indexed.encode()[1], 0x0020_0000 | (5 << 16));
    }

    #[test]
    fn plbu_frame_header_words() {
        assert_eq!(
            PlbuCmd::TiledDimensions {
                tiled_w: 20,
                tiled_h: 15
            }
            .encode(),
            [(19 << 24) | (14 << 8), 0x1000_0109]
        );
        assert_eq!(
            PlbuCmd::ArrayAddress {
                va: 0x4000,
                block_count: 300
            }
            .encode(),
            [0x4000, 0x2800_0000 | 299]
        );
        assert_eq!(
            PlbuCmd::decode([0x4000, 0x2800_0000 | 299]),
            Some(PlbuCmd::ArrayAddress {
                va: 0x4000,
                block_count: 300
            })
        );
        assert_eq!(PlbuCmd::End.encode(), [0, 0x5000_0000]);
    }

    #[test]
    fn primitive_setup_cull_bits() {
        let (cull_cw, cull_ccw) = CullMode::Back.windings(true);
        let words = PlbuCmd::PrimitiveSetup {
            draw: true,
            cull_cw,
            cull_ccw,
            index16: true,
        }
        .encode();
        assert_eq!(words, [0x0002_2600, 0x1000_010B]);
        assert_eq!(CullMode::Front.windings(true), (false, true));
        assert_eq!(CullMode::None.windings(false), (false, false));
    }
}
