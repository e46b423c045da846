//! Target block geometry.

use crate::error::{PbError, Result};

/// Sector and block sizes of a storage target.
///
/// Buffers on a target must be sector aligned. Blocks are the unit of
/// sub-page I/O sharing: when `block_size < page_size`, a page holds
/// several independently valid blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub sector_size: usize,
    pub sector_shift: u32,
    pub sector_mask: u64,
    pub block_size: usize,
    pub block_shift: u32,
}

impl Geometry {
    /// Build from sector and block sizes. Both must be powers of two,
    /// sectors at least 512 bytes, blocks no smaller than a sector.
    pub fn new(sector_size: usize, block_size: usize) -> Result<Self> {
        if !sector_size.is_power_of_two() || sector_size < 512 {
            return Err(PbError::Config("sector size must be a power of two >= 512"));
        }
        if !block_size.is_power_of_two() || block_size < sector_size {
            return Err(PbError::Config("block size must be a power of two >= sector size"));
        }
        Ok(Self {
            sector_size,
            sector_shift: sector_size.trailing_zeros(),
            sector_mask: (sector_size - 1) as u64,
            block_size,
            block_shift: block_size.trailing_zeros(),
        })
    }

    /// True if `offset` and `len` are both sector multiples.
    #[inline]
    pub fn is_aligned(&self, offset: u64, len: usize) -> bool {
        offset & self.sector_mask == 0 && (len as u64) & self.sector_mask == 0
    }

    /// Blocks per page for a given page size.
    #[inline]
    pub fn blocks_per_page(&self, page_size: usize) -> usize {
        (page_size >> self.block_shift).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry() {
        let g = Geometry::new(512, 512).unwrap();
        assert_eq!(g.sector_shift, 9);
        assert_eq!(g.sector_mask, 511);
        assert_eq!(g.blocks_per_page(4096), 8);
        assert!(g.is_aligned(1024, 512));
        assert!(!g.is_aligned(100, 512));
        assert!(!g.is_aligned(512, 100));
    }

    #[test]
    fn test_invalid_geometry() {
        assert!(Geometry::new(256, 4096).is_err());
        assert!(Geometry::new(512, 1000).is_err());
        assert!(Geometry::new(4096, 512).is_err());
    }
}
