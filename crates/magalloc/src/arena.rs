//! Monotonic bump arena over a single reservation, with commit-on-demand
//! and wholesale reset. Built for transient per-frame workloads: nothing is
//! ever freed individually, and `reset` hands the RSS back to the OS.

use crate::error::VmError;
use crate::util::align_up;
use crate::vm::{self, VmRegion};
use core::ptr::NonNull;

pub struct Arena {
    region: VmRegion,
    /// High-water mark of committed bytes.
    committed: usize,
    /// Bump offset of the next allocation.
    offset: usize,
    page_size: usize,
}

impl Arena {
    /// Reserve `reserve_size` bytes of address space. Nothing is committed
    /// until the first allocation.
    pub fn with_capacity(reserve_size: usize) -> Result<Arena, VmError> {
        let region = VmRegion::reserve(reserve_size, 0)?;
        Ok(Arena {
            region,
            committed: 0,
            offset: 0,
            page_size: vm::page_size(),
        })
    }

    /// Bump-allocate `size` bytes at `align`. Returns None when the
    /// reservation is exhausted or the commit fails; both are non-fatal.
    pub fn alloc(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());

        let aligned = align_up(self.offset, align.max(1));
        let end = aligned.checked_add(size)?;
        if end > self.region.size() {
            return None;
        }

        if end > self.committed {
            let new_committed = align_up(end, self.page_size).min(self.region.size());
            if let Err(err) = self
                .region
                .commit(self.committed, new_committed - self.committed)
            {
                log::debug!("arena commit of {} bytes failed: {}", end - self.committed, err);
                return None;
            }
            self.committed = new_committed;
        }

        self.offset = end;
        // Base is non-null while the region is reserved.
        NonNull::new(unsafe { self.region.base().add(aligned) })
    }

    /// Decommit everything and rewind to offset zero. Pointers handed out
    /// before the reset must not be used afterwards.
    pub fn reset(&mut self) {
        if self.committed > 0 {
            self.region.decommit(0, self.committed);
        }
        self.committed = 0;
        self.offset = 0;
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn committed(&self) -> usize {
        self.committed
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.region.size()
    }
}

/// Arena wrapper for per-frame lifetimes: allocate during the frame, call
/// `end_frame` at the boundary.
pub struct FrameArena {
    arena: Arena,
}

impl FrameArena {
    pub fn with_capacity(reserve_size: usize) -> Result<FrameArena, VmError> {
        Ok(FrameArena {
            arena: Arena::with_capacity(reserve_size)?,
        })
    }

    #[inline]
    pub fn alloc(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        self.arena.alloc(size, align)
    }

    /// Reset at the frame boundary.
    pub fn end_frame(&mut self) {
        self.arena.reset();
    }

    #[inline]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }
}

/// Create a frame arena, run `body` with it, and reset before discarding.
pub fn with_frame_arena<R>(
    reserve_size: usize,
    body: impl FnOnce(&mut FrameArena) -> R,
) -> Result<R, VmError> {
    let mut frame = FrameArena::with_capacity(reserve_size)?;
    let result = body(&mut frame);
    frame.end_frame();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::is_aligned;

    #[test]
    fn bump_addresses_are_monotonic() {
        let mut arena = Arena::with_capacity(1 << 20).unwrap();
        let mut last = 0usize;
        for _ in 0..64 {
            let p = arena.alloc(48, 16).unwrap().as_ptr() as usize;
            assert!(p > last);
            assert!(is_aligned(p, 16));
            last = p;
        }
    }

    #[test]
    fn reset_rewinds_to_zero() {
        let mut arena = Arena::with_capacity(1 << 20).unwrap();
        let first = arena.alloc(100, 16).unwrap();
        arena.alloc(100, 16).unwrap();
        assert!(arena.committed() > 0);

        arena.reset();
        assert_eq!(arena.offset(), 0);
        assert_eq!(arena.committed(), 0);

        // The next allocation starts at offset 0 again.
        let again = arena.alloc(100, 16).unwrap();
        assert_eq!(again.as_ptr(), first.as_ptr());
    }

    #[test]
    fn exhaustion_returns_none() {
        let page = vm::page_size();
        let mut arena = Arena::with_capacity(page).unwrap();
        assert!(arena.alloc(page, 16).is_some());
        assert!(arena.alloc(1, 1).is_none());
    }

    #[test]
    fn alignment_is_honored_mid_stream() {
        let mut arena = Arena::with_capacity(1 << 20).unwrap();
        arena.alloc(3, 1).unwrap();
        let p = arena.alloc(64, 256).unwrap().as_ptr() as usize;
        assert!(is_aligned(p, 256));
    }

    #[test]
    fn frame_arena_scope() {
        let ptr_in_frame = with_frame_arena(1 << 20, |frame| {
            let a = frame.alloc(32, 16).unwrap();
            let b = frame.alloc(32, 16).unwrap();
            assert!(b.as_ptr() > a.as_ptr());
            a.as_ptr() as usize
        })
        .unwrap();
        assert_ne!(ptr_in_frame, 0);
    }
}
