// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Frame descriptors passed to the kernel with each submission.
//!
//! These must be kept in sync with the Mali-400 frame structs of the kernel
//! uAPI.

use bytemuck::{Pod, Zeroable};

use crate::{TileGeometry, MAX_PP};

/// Number of write-back units on the PP.
pub const WB_COUNT: usize = 3;

/// GP job: command stream ranges and the tile heap, as GPU addresses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct GpFrame {
    pub vs_cmd_start: u32,
    pub vs_cmd_end: u32,
    pub plbu_cmd_start: u32,
    pub plbu_cmd_end: u32,
    pub tile_heap_start: u32,
    pub tile_heap_end: u32,
}

/// PP frame registers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct PpFrameRegs {
    pub plbu_array_address: u32,
    pub render_address: u32,
    pub unused_0: u32,
    pub flags: u32,
    pub clear_value_depth: u32,
    pub clear_value_stencil: u32,
    pub clear_value_color: u32,
    pub clear_value_color_1: u32,
    pub clear_value_color_2: u32,
    pub clear_value_color_3: u32,
    pub width: u32,
    pub height: u32,
    pub fragment_stack_address: u32,
    pub fragment_stack_size: u32,
    pub unused_1: u32,
    pub unused_2: u32,
    pub one: u32,
    pub supersampled_height: u32,
    pub dubya: u32,
    pub onscreen: u32,
    pub blocking: u32,
    pub scale: u32,
    pub foureight: u32,
}

impl PpFrameRegs {
    /// Registers for rendering `geom` with the render state records starting
    /// at `render_address`. Clear values start at zero.
    pub fn new(render_address: u32, geom: &TileGeometry) -> Self {
        Self {
            render_address,
            flags: 0x02,
            one: 1,
            supersampled_height: (geom.height * 2).saturating_sub(1),
            dubya: 0x77,
            onscreen: 1,
            blocking: geom.block_step(),
            scale: 0xE0C,
            foureight: 0x8888,
            ..Self::default()
        }
    }

    /// Sets the four color clear words, one per render target slot.
    pub fn set_clear_color(&mut self, color: [u32; 4]) {
        self.clear_value_color = color[0];
        self.clear_value_color_1 = color[1];
        self.clear_value_color_2 = color[2];
        self.clear_value_color_3 = color[3];
    }
}

/// Write-back unit registers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct PpWbRegs {
    pub type_: u32,
    pub address: u32,
    pub pixel_format: u32,
    pub downsample_factor: u32,
    pub pixel_layout: u32,
    pub pitch: u32,
    pub mrt_bits: u32,
    pub mrt_pitch: u32,
    pub zero: u32,
    pub unused0: u32,
    pub unused1: u32,
    pub unused2: u32,
}

impl PpWbRegs {
    const TYPE_COLOR: u32 = 0x02;
    const FORMAT_RGBA8888: u32 = 0x03;

    /// Linear RGBA8888 color write-back to `address` with `stride` bytes per
    /// row.
    pub fn color(address: u32, stride: u32) -> Self {
        Self {
            type_: Self::TYPE_COLOR,
            address,
            pixel_format: Self::FORMAT_RGBA8888,
            pitch: stride / 8,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.type_ != 0
    }
}

/// PP job: frame registers, write-back units and per-PP PLB streams.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable, Pod)]
#[repr(C)]
pub struct PpFrame {
    pub frame: PpFrameRegs,
    pub wb: [PpWbRegs; WB_COUNT],
    pub plbu_array_address: [u32; MAX_PP],
    pub fragment_stack_address: [u32; MAX_PP],
    pub num_pp: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<GpFrame>(), 6 * 4);
static_assertions::const_assert_eq!(std::mem::size_of::<PpFrameRegs>(), 23 * 4);
static_assertions::const_assert_eq!(std::mem::size_of::<PpWbRegs>(), 12 * 4);
static_assertions::const_assert_eq!(std::mem::size_of::<PpFrame>(), 68 * 4);

#[cfg(test)]
mod tests {
    use super::{PpFrame, PpFrameRegs, PpWbRegs};
    use crate::TileGeometry;

    #[test]
    fn frame_registers_follow_geometry() {
        let geom = TileGeometry::new(1920, 1080);
        let regs = PpFrameRegs::new(0x8000, &geom);
        assert_eq!(regs.supersampled_height, 2159);
        assert_eq!(regs.blocking, geom.block_step());
        assert_eq!(regs.render_address, 0x8000);
    }

    #[test]
    fn pp_frame_bytes_start_with_registers() {
        let mut frame = PpFrame {
            frame: PpFrameRegs::new(0x8000, &TileGeometry::new(64, 64)),
            num_pp: 2,
            ..PpFrame::default()
        };
        frame.wb[0] = PpWbRegs::color(0x10_0000, 256);
        let words: &[u32] = bytemuck::cast_slice(bytemuck::bytes_of(&frame));
        assert_eq!(words[1], 0x8000);
        assert_eq!(words[23], 0x02);
        assert_eq!(words[23 + 5], 32);
        assert_eq!(words[67], 2);
    }
}
