// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Cache of the per-PP tile streams for each framebuffer geometry.

use std::collections::HashMap;

use lima_encoding::{PlbStreams, TileGeometry, MAX_PP};

use crate::bo::Bo;
use crate::screen::Screen;
use crate::{Error, Result};

/// Identifies the streams of one geometry drawn through one PLB slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PlbKey {
    pub slot: usize,
    pub tiled_w: u32,
    pub tiled_h: u32,
}

impl PlbKey {
    pub fn new(slot: usize, geom: &TileGeometry) -> Self {
        Self {
            slot,
            tiled_w: geom.tiled_w,
            tiled_h: geom.tiled_h,
        }
    }
}

/// The streams for one key, built the first time they are drawn to.
#[derive(Debug)]
pub struct PlbStreamEntry {
    /// Number of live surfaces with this geometry.
    pub refcount: u32,
    /// The streams, once populated.
    pub bo: Option<Bo>,
    /// Byte offset of each PP's stream in `bo`.
    pub per_pp_offsets: [u32; MAX_PP],
}

impl PlbStreamEntry {
    /// GPU address of the streams of the first `num_pp` PPs, zero for the
    /// rest.
    pub fn stream_addresses(&self, num_pp: usize) -> [u32; MAX_PP] {
        let mut out = [0; MAX_PP];
        if let Some(va) = self.bo.as_ref().and_then(Bo::va) {
            for (out, offset) in out.iter_mut().zip(self.per_pp_offsets).take(num_pp) {
                *out = va + offset;
            }
        }
        out
    }
}

/// Reference counted stream buffers, one per `(slot, tiled_w, tiled_h)`.
#[derive(Debug)]
pub struct PlbCache {
    entries: HashMap<PlbKey, PlbStreamEntry>,
    num_pp: usize,
}

impl PlbCache {
    pub fn new(num_pp: usize) -> Self {
        Self {
            entries: HashMap::new(),
            num_pp,
        }
    }

    /// Takes a reference on `key`, creating an empty entry if needed.
    /// Returns the new reference count.
    pub fn register(&mut self, key: PlbKey) -> u32 {
        let entry = self.entries.entry(key).or_insert(PlbStreamEntry {
            refcount: 0,
            bo: None,
            per_pp_offsets: [0; MAX_PP],
        });
        entry.refcount += 1;
        entry.refcount
    }

    /// Drops a reference on `key`, freeing the streams with the last one.
    pub fn unregister(&mut self, key: PlbKey) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                log::debug!("plb: releasing streams for {key:?}");
                self.entries.remove(&key);
            }
        }
    }

    pub fn entry(&self, key: &PlbKey) -> Option<&PlbStreamEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the streams of a registered key, building them into a new
    /// buffer on first use. Tiles point into the PLB at `plb_va`.
    pub fn get_or_populate(
        &mut self,
        screen: &Screen,
        key: PlbKey,
        geom: &TileGeometry,
        plb_va: u32,
    ) -> Result<&PlbStreamEntry> {
        let num_pp = self.num_pp;
        let entry = self
            .entries
            .get_mut(&key)
            .ok_or(Error::UnregisteredGeometry {
                tiled_w: key.tiled_w,
                tiled_h: key.tiled_h,
            })?;
        if entry.bo.is_none() {
            let streams = PlbStreams::build(geom, num_pp, plb_va);
            let bytes = streams.as_bytes();
            let bo = screen.bo_create(bytes.len() as u32, 0)?;
            bo.update(true, true)?;
            bo.write(0, bytes)?;
            for (slot, offset) in entry.per_pp_offsets.iter_mut().zip(streams.offsets()) {
                *slot = offset;
            }
            log::debug!(
                "plb: built {} bytes of streams for {key:?}",
                bytes.len()
            );
            entry.bo = Some(bo);
        }
        Ok(entry)
    }
}
