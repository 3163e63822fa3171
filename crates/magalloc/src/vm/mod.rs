//! Virtual-memory substrate: reserve/commit/decommit/protect/release over
//! page-aligned regions. One OS-specific backend is selected per target and
//! re-exported as `sys`; everything above it is portable.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
use linux as sys;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
use macos as sys;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
use windows as sys;

use crate::debug;
use crate::error::VmError;
use crate::util::{align_down, align_up};
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Page protection states a committed range can be moved between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    NoAccess,
    Read,
    ReadWrite,
}

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
static GRANULARITY: AtomicUsize = AtomicUsize::new(0);

/// OS page size, queried once per process.
#[inline]
pub fn page_size() -> usize {
    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let sz = sys::page_size();
            PAGE_SIZE.store(sz, Ordering::Relaxed);
            sz
        }
        sz => sz,
    }
}

/// Minimum alignment of a reservation base, queried once per process.
/// Equal to the page size on POSIX; 64 KiB on Windows.
#[inline]
pub fn allocation_granularity() -> usize {
    match GRANULARITY.load(Ordering::Relaxed) {
        0 => {
            let g = sys::allocation_granularity();
            GRANULARITY.store(g, Ordering::Relaxed);
            g
        }
        g => g,
    }
}

/// A reserved range of address space. Pages transition independently between
/// no-access (reserved/decommitted), read-only and read-write.
///
/// Dropping a region releases it; `release` may also be called explicitly
/// and is idempotent.
#[derive(Debug)]
pub struct VmRegion {
    base: *mut u8,
    size: usize,
    page_size: usize,
}

// The region is a plain address range; access synchronization is the
// caller's responsibility.
unsafe impl Send for VmRegion {}
unsafe impl Sync for VmRegion {}

impl VmRegion {
    /// Reserve at least `size` bytes of no-access address space.
    ///
    /// When `alignment` exceeds the allocation granularity the reservation
    /// is over-sized and the base aligned upward; the slack is returned to
    /// the OS by the backend.
    pub fn reserve(size: usize, alignment: usize) -> Result<VmRegion, VmError> {
        if size == 0 {
            debug_assert!(false, "zero-size reservation");
            return Err(VmError::InvalidParameters);
        }

        #[cfg(test)]
        if fault::reserve_should_fail() {
            return Err(VmError::ReserveFailed);
        }
        #[cfg(test)]
        fault::note_reserve_attempt();

        let page = page_size();
        let aligned_size = align_up(size, page);
        let granularity = allocation_granularity();

        let base = if alignment > granularity {
            debug_assert!(alignment.is_power_of_two());
            unsafe { sys::reserve_aligned(aligned_size, alignment) }
        } else {
            unsafe { sys::reserve(aligned_size) }
        };

        if base.is_null() {
            return Err(VmError::ReserveFailed);
        }

        Ok(VmRegion {
            base,
            size: aligned_size,
            page_size: page,
        })
    }

    /// Rebuild a region from a base/size pair recorded elsewhere (the large
    /// tier stores them in its header).
    ///
    /// # Safety
    /// `base`/`size` must describe a live reservation created by `reserve`
    /// and not owned by any other `VmRegion`.
    pub(crate) unsafe fn from_raw(base: *mut u8, size: usize) -> VmRegion {
        VmRegion {
            base,
            size,
            page_size: page_size(),
        }
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_reserved(&self) -> bool {
        !self.base.is_null()
    }

    /// Clamp a byte range to page boundaries: offset down, end up.
    /// Returns None when the aligned range leaves the region.
    fn page_range(&self, offset: usize, len: usize) -> Option<(usize, usize)> {
        let start = align_down(offset, self.page_size);
        let end = align_up(offset.checked_add(len)?, self.page_size);
        if end > self.size || len == 0 {
            return None;
        }
        Some((start, end - start))
    }

    /// Transition a range to read-write, backing it with memory.
    pub fn commit(&self, offset: usize, len: usize) -> Result<(), VmError> {
        if !self.is_reserved() {
            debug_assert!(false, "commit on released region");
            return Err(VmError::InvalidParameters);
        }
        let (start, aligned_len) = match self.page_range(offset, len) {
            Some(r) => r,
            None => {
                debug_assert!(false, "commit range out of bounds");
                return Err(VmError::InvalidParameters);
            }
        };
        let ok = unsafe { sys::commit(self.base.add(start), aligned_len) };
        if !ok {
            return Err(VmError::CommitFailed);
        }
        debug::count_commit();
        // Large ranges benefit from huge pages; the advice may be refused.
        if aligned_len >= 2 * 1024 * 1024 {
            unsafe { sys::advise_huge(self.base.add(start), aligned_len) };
        }
        Ok(())
    }

    /// Return backing pages to the OS while keeping the address range
    /// reserved. Out-of-range input is a silent no-op.
    pub fn decommit(&self, offset: usize, len: usize) {
        if !self.is_reserved() {
            return;
        }
        let (start, aligned_len) = match self.page_range(offset, len) {
            Some(r) => r,
            None => return,
        };
        unsafe { sys::decommit(self.base.add(start), aligned_len) };
        debug::count_decommit();
    }

    /// Change the protection of a committed range.
    pub fn protect(&self, offset: usize, len: usize, prot: Protection) -> Result<(), VmError> {
        if !self.is_reserved() {
            debug_assert!(false, "protect on released region");
            return Err(VmError::InvalidParameters);
        }
        let (start, aligned_len) = match self.page_range(offset, len) {
            Some(r) => r,
            None => {
                debug_assert!(false, "protect range out of bounds");
                return Err(VmError::InvalidParameters);
            }
        };
        let ok = unsafe { sys::protect(self.base.add(start), aligned_len, prot) };
        if ok {
            Ok(())
        } else {
            Err(VmError::ProtectFailed)
        }
    }

    /// Release the entire reservation. Idempotent.
    pub fn release(&mut self) {
        if self.base.is_null() {
            return;
        }
        unsafe { sys::release(self.base, self.size) };
        self.base = ptr::null_mut();
    }
}

impl Drop for VmRegion {
    fn drop(&mut self) {
        self.release();
    }
}
