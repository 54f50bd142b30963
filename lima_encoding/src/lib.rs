// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Command stream and frame descriptor encoding for Mali-4xx GPUs.
//!
//! Everything in this crate is pure: it turns framebuffer geometry and draw
//! state into the bit-packed 32-bit words consumed by the geometry processor
//! (GP) and the pixel processors (PP), and decodes them back for dumps and
//! tests. Buffer management and submission live in the `lima` crate.

// LINEBENDER LINT SET - lib.rs - v2
// See https://linebender.org/wiki/canonical-lints/
// These lints aren't included in Cargo.toml because they
// shouldn't apply to examples and tests
#![warn(unused_crate_dependencies)]
#![warn(clippy::print_stdout, clippy::print_stderr)]
// Targeting e.g. 32-bit means structs containing usize can give false positives for 64-bit.
#![cfg_attr(target_pointer_width = "64", warn(clippy::trivially_copy_pass_by_ref))]
// END LINEBENDER LINT SET
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod attrib;
mod frame;
mod gp;
mod hilbert;
mod pp;
mod tiling;

pub use attrib::{AttribType, AttributeDescriptor, ChannelKind, VaryingDescriptor};
pub use frame::{GpFrame, PpFrame, PpFrameRegs, PpWbRegs, WB_COUNT};
pub use gp::{CullMode, DrawMode, IndexSize, PlbuCmd, VsCmd};
pub use hilbert::{hilbert_coords, PlbStreams};
pub use pp::{
    BlendFactor, BlendFunc, BlendState, DepthRange, RenderState, StencilFace, StencilOp,
};
pub use tiling::{TileGeometry, MAX_FRAMEBUFFER_SIZE, PLB_BLOCK_SIZE, PLB_MAX_BLOCKS, TILE_SIZE};

/// Maximum number of pixel processors on any Mali-4xx part.
pub const MAX_PP: usize = 4;

/// Converts a float to its raw bit pattern, as the hardware consumes floats
/// in command words.
#[inline]
pub fn fui(value: f32) -> u32 {
    value.to_bits()
}
