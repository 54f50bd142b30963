// Copyright 2024 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A first-fit allocator for the GPU virtual address space.

use std::collections::BTreeMap;

use crate::{Error, Result};

/// Granularity of GPU virtual address allocations.
pub const PAGE_SIZE: u64 = 4096;

/// An allocator that tracks free ranges of a fixed address window and
/// returns the lowest one that fits.
#[derive(Debug)]
pub struct VaAllocator {
    // map offset to size of free block
    holes: BTreeMap<u64, u64>,
    start: u64,
    end: u64,
}

impl VaAllocator {
    /// Creates an allocator managing `[start, end)`, initially all free.
    pub fn new(start: u64, end: u64) -> Self {
        let mut holes = BTreeMap::new();
        if end > start {
            holes.insert(start, end - start);
        }
        Self { holes, start, end }
    }

    /// Allocates `size` bytes, rounded up to [`PAGE_SIZE`].
    pub fn alloc(&mut self, size: u64) -> Result<u64> {
        let size = round_up(size.max(1)).ok_or(Error::OutOfVaSpace)?;
        let (&offset, &hole_size) = self
            .holes
            .iter()
            .find(|&(_, &hole_size)| hole_size >= size)
            .ok_or(Error::OutOfVaSpace)?;
        self.holes.remove(&offset);
        if hole_size > size {
            self.holes.insert(offset + size, hole_size - size);
        }
        log::debug!("va: alloc {offset:#x}+{size:#x}");
        Ok(offset)
    }

    /// Returns a range obtained from [`VaAllocator::alloc`].
    ///
    /// A range outside the window or overlapping a free range is rejected
    /// and the allocator is left unchanged.
    pub fn free(&mut self, offset: u64, size: u64) -> Result<()> {
        let invalid = Error::InvalidRange { offset, size };
        let size = round_up(size.max(1)).ok_or(Error::InvalidRange { offset, size })?;
        let end = offset.checked_add(size).ok_or(Error::InvalidRange { offset, size })?;
        if offset < self.start || end > self.end {
            return Err(invalid);
        }
        let prev = self
            .holes
            .range(..=offset)
            .next_back()
            .map(|(&o, &s)| (o, s));
        let next = self.holes.range(offset..).next().map(|(&o, &s)| (o, s));
        if prev.is_some_and(|(o, s)| o + s > offset) || next.is_some_and(|(o, _)| o < end) {
            return Err(invalid);
        }
        log::debug!("va: free {offset:#x}+{size:#x}");
        let mut new_offset = offset;
        let mut new_size = size;
        if let Some((prev_offset, prev_size)) = prev {
            if prev_offset + prev_size == offset {
                // consolidate with prev
                new_offset = prev_offset;
                new_size += prev_size;
            }
        }
        if let Some((next_offset, next_size)) = next {
            if next_offset == end {
                // consolidate with next
                self.holes.remove(&next_offset);
                new_size += next_size;
            }
        }
        self.holes.insert(new_offset, new_size);
        Ok(())
    }

    /// The free ranges in address order, as `(offset, size)`.
    pub fn holes(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.holes.iter().map(|(&o, &s)| (o, s))
    }

    /// Total number of free bytes.
    pub fn free_bytes(&self) -> u64 {
        self.holes.values().sum()
    }
}

fn round_up(size: u64) -> Option<u64> {
    Some(size.checked_add(PAGE_SIZE - 1)? & !(PAGE_SIZE - 1))
}

#[cfg(test)]
mod tests {
    use super::{VaAllocator, PAGE_SIZE};
    use crate::Error;

    const MB: u64 = 1 << 20;

    fn holes(va: &VaAllocator) -> Vec<(u64, u64)> {
        va.holes().collect()
    }

    #[test]
    fn first_fit_from_the_bottom() {
        let mut va = VaAllocator::new(0, MB);
        let a = va.alloc(4096).unwrap();
        let b = va.alloc(8192).unwrap();
        let c = va.alloc(4096).unwrap();
        assert_eq!((a, b, c), (0, 0x1000, 0x3000));
        assert_eq!(holes(&va), [(0x4000, MB - 0x4000)]);
    }

    #[test]
    fn sizes_round_up_to_pages() {
        let mut va = VaAllocator::new(0x10_0000, 0x20_0000);
        assert_eq!(va.alloc(1).unwrap(), 0x10_0000);
        assert_eq!(va.alloc(PAGE_SIZE + 1).unwrap(), 0x10_1000);
        assert_eq!(va.alloc(0).unwrap(), 0x10_3000);
    }

    #[test]
    fn freeing_coalesces() {
        let mut va = VaAllocator::new(0, MB);
        let a = va.alloc(4096).unwrap();
        let b = va.alloc(8192).unwrap();
        let c = va.alloc(4096).unwrap();
        va.free(b, 8192).unwrap();
        assert_eq!(holes(&va), [(b, 8192), (0x4000, MB - 0x4000)]);
        va.free(a, 4096).unwrap();
        assert_eq!(holes(&va), [(0, 0x3000), (0x4000, MB - 0x4000)]);
        va.free(c, 4096).unwrap();
        assert_eq!(holes(&va), [(0, MB)]);
    }

    #[test]
    fn freeing_coalesces_in_any_order() {
        let mut va = VaAllocator::new(0, MB);
        let a = va.alloc(4096).unwrap();
        let b = va.alloc(8192).unwrap();
        let c = va.alloc(4096).unwrap();
        va.free(c, 4096).unwrap();
        va.free(a, 4096).unwrap();
        va.free(b, 8192).unwrap();
        assert_eq!(holes(&va), [(0, MB)]);
    }

    #[test]
    fn reuses_the_lowest_fitting_hole() {
        let mut va = VaAllocator::new(0, MB);
        let a = va.alloc(4096).unwrap();
        let _b = va.alloc(4096).unwrap();
        va.free(a, 4096).unwrap();
        assert_eq!(va.alloc(8192).unwrap(), 0x2000);
        assert_eq!(va.alloc(4096).unwrap(), a);
    }

    #[test]
    fn exhaustion_is_recoverable() {
        let mut va = VaAllocator::new(0, 4 * PAGE_SIZE);
        let a = va.alloc(4 * PAGE_SIZE).unwrap();
        assert!(matches!(va.alloc(PAGE_SIZE), Err(Error::OutOfVaSpace)));
        va.free(a, 4 * PAGE_SIZE).unwrap();
        assert_eq!(va.alloc(PAGE_SIZE).unwrap(), 0);
    }

    #[test]
    fn overlapping_free_is_rejected() {
        let mut va = VaAllocator::new(0, MB);
        let a = va.alloc(8192).unwrap();
        va.free(a, 4096).unwrap();
        let before = holes(&va);
        assert!(matches!(
            va.free(a, 4096),
            Err(Error::InvalidRange { .. })
        ));
        assert!(matches!(
            va.free(0x1000, 8192),
            Err(Error::InvalidRange { .. })
        ));
        assert!(matches!(va.free(MB, 4096), Err(Error::InvalidRange { .. })));
        assert_eq!(holes(&va), before);
    }

    #[test]
    fn live_ranges_never_overlap() {
        let mut va = VaAllocator::new(0x1000, 0x40_0000);
        let mut live: Vec<(u64, u64)> = Vec::new();
        for i in 0..64_u64 {
            let size = (i % 5 + 1) * PAGE_SIZE;
            let offset = va.alloc(size).unwrap();
            live.push((offset, size));
            if i % 3 == 0 {
                let (o, s) = live.remove(live.len() / 2);
                va.free(o, s).unwrap();
            }
        }
        live.sort_unstable();
        for pair in live.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }
        let used: u64 = live.iter().map(|(_, s)| s).sum();
        assert_eq!(va.free_bytes() + used, 0x40_0000 - 0x1000);
    }
}
