// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

/// Width and height of a rasterizer tile, in pixels.
pub const TILE_SIZE: u32 = 16;

/// Bytes of PLB memory reserved for each block.
pub const PLB_BLOCK_SIZE: u32 = 512;

/// Upper bound on PLB blocks per frame.
///
/// The hardware accepts 512; staying slightly below leaves room for rounding
/// when the block grid is halved.
pub const PLB_MAX_BLOCKS: u32 = 500;

/// Largest framebuffer width or height the PP can render, in pixels.
///
/// Tile coordinates are 8 bits wide in the PLB streams.
pub const MAX_FRAMEBUFFER_SIZE: u32 = 4096;

/// Framebuffer geometry in tiles, and how tiles are grouped into PLB blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TileGeometry {
    pub width: u32,
    pub height: u32,
    /// Width in tiles.
    pub tiled_w: u32,
    /// Height in tiles.
    pub tiled_h: u32,
    /// Horizontal halvings applied to reach the block grid.
    pub shift_w: u32,
    pub shift_h: u32,
    /// Block grid dimensions.
    pub block_w: u32,
    pub block_h: u32,
    /// Larger of the two shifts, saturated at 2.
    pub shift_max: u32,
}

impl TileGeometry {
    /// Computes the geometry of a `width` by `height` pixel framebuffer, or
    /// `None` if either side is zero or exceeds [`MAX_FRAMEBUFFER_SIZE`].
    pub fn try_new(width: u32, height: u32) -> Option<Self> {
        let valid = 1..=MAX_FRAMEBUFFER_SIZE;
        (valid.contains(&width) && valid.contains(&height)).then(|| Self::new(width, height))
    }

    /// Computes the geometry of a `width` by `height` pixel framebuffer.
    ///
    /// Sizes above [`MAX_FRAMEBUFFER_SIZE`] produce a geometry the hardware
    /// cannot render; use [`TileGeometry::try_new`] for untrusted sizes.
    pub fn new(width: u32, height: u32) -> Self {
        let tiled_w = width.div_ceil(TILE_SIZE);
        let tiled_h = height.div_ceil(TILE_SIZE);
        let (mut block_w, mut block_h) = (tiled_w, tiled_h);
        let (mut shift_w, mut shift_h) = (0, 0);
        while u64::from(block_w) * u64::from(block_h) > u64::from(PLB_MAX_BLOCKS) {
            if block_w >= block_h {
                block_w = (block_w + 1) >> 1;
                shift_w += 1;
            } else {
                block_h = (block_h + 1) >> 1;
                shift_h += 1;
            }
        }
        let shift_max = shift_w.max(shift_h).min(2);
        Self {
            width,
            height,
            tiled_w,
            tiled_h,
            shift_w,
            shift_h,
            block_w,
            block_h,
            shift_max,
        }
    }

    /// Number of tiles covering the framebuffer.
    pub fn tile_count(&self) -> u32 {
        self.tiled_w * self.tiled_h
    }

    /// Number of PLB blocks the tiles are grouped into.
    pub fn block_count(&self) -> u32 {
        self.block_w * self.block_h
    }

    /// Byte offset of the PLB block holding tile `(x, y)`.
    pub fn block_offset(&self, x: u32, y: u32) -> u32 {
        ((y >> self.shift_h) * self.block_w + (x >> self.shift_w)) * PLB_BLOCK_SIZE
    }

    /// The `BLOCK_STEP` word shared by the PLBU stream and the PP frame.
    pub fn block_step(&self) -> u32 {
        (self.shift_max << 28) | (self.shift_h << 16) | self.shift_w
    }

    /// The key used to share PLB streams between surfaces.
    pub fn key(&self) -> (u32, u32) {
        (self.tiled_w, self.tiled_h)
    }
}

#[cfg(test)]
mod tests {
    use super::{TileGeometry, MAX_FRAMEBUFFER_SIZE, PLB_MAX_BLOCKS};

    #[test]
    fn small_surface_needs_no_blocking() {
        let geom = TileGeometry::new(100, 40);
        assert_eq!((geom.tiled_w, geom.tiled_h), (7, 3));
        assert_eq!((geom.block_w, geom.block_h), (7, 3));
        assert_eq!((geom.shift_w, geom.shift_h, geom.shift_max), (0, 0, 0));
        assert_eq!(geom.block_step(), 0);
    }

    #[test]
    fn full_hd_is_halved_below_limit() {
        let geom = TileGeometry::new(1920, 1080);
        assert_eq!((geom.tiled_w, geom.tiled_h), (120, 68));
        // 120x68 -> 60x68 -> 60x34 -> 30x34 -> 30x17 -> 15x17
        assert_eq!((geom.block_w, geom.block_h), (15, 17));
        assert_eq!((geom.shift_w, geom.shift_h), (3, 2));
        assert_eq!(geom.shift_max, 2);
        assert!(geom.block_count() <= PLB_MAX_BLOCKS);
    }

    #[test]
    fn shift_max_saturates() {
        let geom = TileGeometry::new(4096, 128);
        assert_eq!((geom.tiled_w, geom.tiled_h), (256, 8));
        assert_eq!((geom.block_w, geom.shift_w), (32, 3));
        assert_eq!(geom.shift_max, 2);
        assert!(geom.block_count() <= PLB_MAX_BLOCKS);
    }

    #[test]
    fn block_offset_follows_shifts() {
        let geom = TileGeometry::new(1920, 1080);
        assert_eq!(geom.block_offset(0, 0), 0);
        assert_eq!(geom.block_offset(7, 3), 0);
        assert_eq!(geom.block_offset(8, 0), 512);
        assert_eq!(geom.block_offset(0, 4), 15 * 512);
    }

    #[test]
    fn oversized_framebuffers_have_no_geometry() {
        assert!(TileGeometry::try_new(0, 64).is_none());
        assert!(TileGeometry::try_new(MAX_FRAMEBUFFER_SIZE + 1, 64).is_none());
        let max = TileGeometry::try_new(MAX_FRAMEBUFFER_SIZE, MAX_FRAMEBUFFER_SIZE).unwrap();
        assert_eq!(max.key(), (256, 256));
        assert!(max.block_count() <= PLB_MAX_BLOCKS);
        // Huge sizes still terminate without overflowing.
        let huge = TileGeometry::new(u32::MAX, u32::MAX);
        assert!(huge.block_count() <= PLB_MAX_BLOCKS);
    }
}
