// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-PP tile streams ordered along a Hilbert curve.
//!
//! Each pixel processor walks its own stream of tiles. Dealing consecutive
//! curve positions round-robin keeps the tiles of different PPs spatially
//! close, which balances load and keeps caches warm.

use smallvec::SmallVec;

use crate::{TileGeometry, MAX_FRAMEBUFFER_SIZE, MAX_PP, TILE_SIZE};

/// Words emitted per tile.
const TILE_WORDS: usize = 4;
/// Words terminating each stream.
const END_WORDS: usize = 2;

const TILE_BEGIN: u32 = 0xB800_0000;
const TILE_PLB: u32 = 0xE000_0002;
const TILE_PLB_MASK: u32 = !0xE000_0003;
const TILE_END: u32 = 0xB000_0000;
const STREAM_END: u32 = 0xBC00_0000;

/// Maps position `d` on a Hilbert curve covering an `n` by `n` grid to 2D
/// coordinates.
///
/// `n` need not be a power of two; the curve covers the enclosing
/// power-of-two square.
pub fn hilbert_coords(n: u32, d: u32) -> (u32, u32) {
    let (mut x, mut y) = (0_u32, 0_u32);
    let mut t = d;
    let mut i = 0;
    while (1_u32 << i) < n {
        let rx = 1 & (t / 2);
        let ry = 1 & (t ^ rx);
        if ry == 0 {
            let side = 1 << i;
            if rx == 1 {
                x = side - 1 - x;
                y = side - 1 - y;
            }
            std::mem::swap(&mut x, &mut y);
        }
        x += rx << i;
        y += ry << i;
        t /= 4;
        i += 1;
    }
    (x, y)
}

/// The PLB streams of all PPs for one framebuffer geometry, laid out back to
/// back with a fixed per-PP stride.
#[derive(Clone, Debug)]
pub struct PlbStreams {
    words: Vec<u32>,
    stride: usize,
    num_pp: usize,
}

impl PlbStreams {
    /// Size in bytes reserved for each PP's stream.
    pub fn stride_bytes(geom: &TileGeometry, num_pp: usize) -> u32 {
        (Self::stride_words(geom, num_pp) * 4) as u32
    }

    fn stride_words(geom: &TileGeometry, num_pp: usize) -> usize {
        let per_pp = (geom.tile_count() as usize).div_ceil(num_pp.max(1));
        per_pp * TILE_WORDS + END_WORDS
    }

    /// Builds the streams for `geom`, pointing each tile at its block inside
    /// the PLB starting at GPU address `plb_va`.
    ///
    /// # Panics
    ///
    /// If `num_pp` is not in `1..=MAX_PP`, or the geometry is larger than
    /// [`MAX_FRAMEBUFFER_SIZE`] in either direction.
    pub fn build(geom: &TileGeometry, num_pp: usize, plb_va: u32) -> Self {
        assert!((1..=MAX_PP).contains(&num_pp));
        let max_tiles = MAX_FRAMEBUFFER_SIZE / TILE_SIZE;
        assert!(
            geom.tiled_w <= max_tiles && geom.tiled_h <= max_tiles,
            "{}x{} tiles do not fit the stream encoding",
            geom.tiled_w,
            geom.tiled_h
        );
        let stride = Self::stride_words(geom, num_pp);
        let mut words = vec![0; stride * num_pp];
        let mut cursor: SmallVec<[usize; MAX_PP]> = (0..num_pp).map(|pp| pp * stride).collect();

        let max = geom.tiled_w.max(geom.tiled_h);
        let dim = max.next_power_of_two().trailing_zeros();
        let count = 1_u32 << (dim * 2);
        let mut index = 0;
        for d in 0..count {
            let (x, y) = hilbert_coords(max, d);
            if x >= geom.tiled_w || y >= geom.tiled_h {
                continue;
            }
            let pp = index % num_pp;
            let block_va = plb_va + geom.block_offset(x, y);
            let at = cursor[pp];
            words[at..at + TILE_WORDS].copy_from_slice(&[
                0,
                TILE_BEGIN | x | (y << 8),
                TILE_PLB | ((block_va >> 3) & TILE_PLB_MASK),
                TILE_END,
            ]);
            cursor[pp] += TILE_WORDS;
            index += 1;
        }
        for at in cursor {
            words[at..at + END_WORDS].copy_from_slice(&[0, STREAM_END]);
        }
        Self {
            words,
            stride,
            num_pp,
        }
    }

    pub fn num_pp(&self) -> usize {
        self.num_pp
    }

    /// Byte offset of each PP's stream from the start of the buffer.
    pub fn offsets(&self) -> SmallVec<[u32; MAX_PP]> {
        (0..self.num_pp)
            .map(|pp| (pp * self.stride * 4) as u32)
            .collect()
    }

    /// The words reserved for `pp`, including unused padding after the end
    /// marker.
    pub fn stream(&self, pp: usize) -> &[u32] {
        &self.words[pp * self.stride..(pp + 1) * self.stride]
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }

    /// Tile coordinates visited by `pp`, in stream order.
    pub fn tiles(&self, pp: usize) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.stream(pp)
            .chunks_exact(TILE_WORDS)
            .take_while(|chunk| chunk[1] & 0xFF00_0000 == TILE_BEGIN)
            .map(|chunk| (chunk[1] & 0xFF, (chunk[1] >> 8) & 0xFF))
    }
}

#[cfg(test)]
mod tests {
    use super::{hilbert_coords, PlbStreams, STREAM_END};
    use crate::{TileGeometry, MAX_FRAMEBUFFER_SIZE};

    #[test]
    fn curve_starts_at_origin_and_stays_adjacent() {
        let n = 8;
        let mut prev = hilbert_coords(n, 0);
        assert_eq!(prev, (0, 0));
        for d in 1..n * n {
            let cur = hilbert_coords(n, d);
            let dist = prev.0.abs_diff(cur.0) + prev.1.abs_diff(cur.1);
            assert_eq!(dist, 1, "step {d} jumps from {prev:?} to {cur:?}");
            prev = cur;
        }
    }

    #[test]
    fn every_tile_is_visited_once() {
        let geom = TileGeometry::new(200, 120);
        for num_pp in 1..=4 {
            let streams = PlbStreams::build(&geom, num_pp, 0x1000_0000);
            let mut seen = vec![0_u32; geom.tile_count() as usize];
            for pp in 0..num_pp {
                for (x, y) in streams.tiles(pp) {
                    seen[(y * geom.tiled_w + x) as usize] += 1;
                }
            }
            assert!(seen.iter().all(|&n| n == 1), "num_pp = {num_pp}");
        }
    }

    #[test]
    fn streams_are_terminated_and_aligned() {
        let geom = TileGeometry::new(64, 64);
        let streams = PlbStreams::build(&geom, 2, 0x2000_0000);
        let offsets = streams.offsets();
        assert_eq!(offsets.as_slice(), &[0, PlbStreams::stride_bytes(&geom, 2)]);
        for pp in 0..2 {
            let tiles = streams.tiles(pp).count();
            assert_eq!(tiles, 8);
            let stream = streams.stream(pp);
            assert_eq!(&stream[tiles * 4..tiles * 4 + 2], &[0, STREAM_END]);
        }
    }

    #[test]
    fn tile_points_at_its_block() {
        let geom = TileGeometry::new(16, 16);
        let streams = PlbStreams::build(&geom, 1, 0x1000_0000);
        let stream = streams.stream(0);
        assert_eq!(stream[1], 0xB800_0000);
        assert_eq!(stream[2], 0xE000_0002 | (0x1000_0000 >> 3));
        assert_eq!(stream[3], 0xB000_0000);
    }

    #[test]
    fn largest_framebuffer_reaches_the_far_corner() {
        let geom = TileGeometry::new(MAX_FRAMEBUFFER_SIZE, MAX_FRAMEBUFFER_SIZE);
        let streams = PlbStreams::build(&geom, 4, 0);
        let corner = (0..4).flat_map(|pp| streams.tiles(pp)).filter(|&t| t == (255, 255));
        assert_eq!(corner.count(), 1);
    }

    #[test]
    #[should_panic(expected = "do not fit the stream encoding")]
    fn oversized_geometry_is_refused() {
        let geom = TileGeometry::new(MAX_FRAMEBUFFER_SIZE + 16, 64);
        PlbStreams::build(&geom, 1, 0);
    }
}
