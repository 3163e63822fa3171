//! A block is one committed VM region carved into equal-size bins and
//! owned by a single size class for the life of the allocator.

use super::size_class;
use crate::error::VmError;
use crate::vm::{self, VmRegion};

pub(crate) struct Block {
    region: VmRegion,
    bin_size: usize,
    bin_count: usize,
}

impl Block {
    /// Reserve and commit a fresh block for `class`.
    pub fn carve(class: usize) -> Result<Block, VmError> {
        let bin_size = size_class::bin_size(class);
        let bytes = size_class::block_bytes(class);

        let region = VmRegion::reserve(bytes, vm::allocation_granularity())?;
        region.commit(0, bytes)?;

        Ok(Block {
            bin_count: bytes / bin_size,
            bin_size,
            region,
        })
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.region.base()
    }

    #[inline]
    pub fn bin_count(&self) -> usize {
        self.bin_count
    }

    #[inline]
    pub fn bin_size(&self) -> usize {
        self.bin_size
    }

    /// Start of bin `index`.
    ///
    /// # Safety
    /// `index < bin_count`.
    #[inline]
    pub unsafe fn bin_at(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.bin_count);
        self.region.base().add(index * self.bin_size)
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.region.base() as usize;
        addr >= base && addr < base + self.bin_count * self.bin_size
    }
}
