//! Large tier: one VM reservation per allocation, with alignment support
//! and optional guard pages. A header directly before the user pointer
//! carries the region geometry and a magic cookie; the magic is the single
//! source of truth when routing a pointer back to its tier at free time.

use crate::debug;
use crate::util::{align_down, align_up, MIN_ALIGN};
use crate::vm::{self, VmRegion};
use ahash::AHashSet;
use core::mem;
use core::ptr::NonNull;
use parking_lot::Mutex;
use std::sync::LazyLock;

/// Sentinel for a live large allocation.
pub const LARGE_MAGIC: u64 = 0x4c41_5247_454d_4147; // "LARGEMAG"

/// Stored immediately before the user pointer, inside the committed
/// interior.
#[repr(C)]
struct LargeHeader {
    vm_base: usize,
    total_size: usize,
    requested_size: usize,
    guard_pages: usize,
    offset_from_base: usize,
    magic: u64,
}

const HEADER_SIZE: usize = mem::size_of::<LargeHeader>();
const HEADER_SLACK: usize = align_up(HEADER_SIZE, MIN_ALIGN);

pub struct LargeAllocator {
    /// Live user pointers. Only consulted when the header cannot be probed
    /// without risking a fault (user pointer too close to a page start).
    registry: Mutex<AHashSet<usize>>,
}

impl LargeAllocator {
    pub fn new() -> LargeAllocator {
        LargeAllocator {
            registry: Mutex::new(AHashSet::new()),
        }
    }

    /// Allocate with the build-default guard policy: guard pages on in
    /// debug builds, off in release.
    pub fn allocate(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        self.allocate_with_guards(size, alignment, cfg!(debug_assertions))
    }

    /// Allocate `size` bytes at `alignment`, optionally fenced by a
    /// no-access page on each side. Returns None on reservation or commit
    /// failure.
    pub fn allocate_with_guards(
        &self,
        size: usize,
        alignment: usize,
        guards: bool,
    ) -> Option<NonNull<u8>> {
        debug_assert!(alignment.is_power_of_two());
        let align = alignment.max(MIN_ALIGN);
        let page = vm::page_size();
        let guard_bytes = if guards { page } else { 0 };

        // Room for the header plus the worst-case alignment adjustment of
        // the user pointer.
        let over = if align > page {
            align + HEADER_SLACK
        } else {
            align_up(HEADER_SLACK, align)
        };
        let total = align_up(
            size.checked_add(over)?.checked_add(2 * guard_bytes)?,
            page,
        );

        let region = match VmRegion::reserve(total, align) {
            Ok(r) => r,
            Err(err) => {
                log::debug!("large reserve of {} bytes failed: {}", total, err);
                return None;
            }
        };

        // Reservation leaves every page no-access, so the guard pages are
        // already fenced; committing only the interior keeps them that way.
        if let Err(err) = region.commit(guard_bytes, total - 2 * guard_bytes) {
            log::debug!("large commit of {} bytes failed: {}", total, err);
            return None;
        }

        // Right-align the user data against the trailing guard so forward
        // overruns fault on the first out-of-bounds byte.
        let base = region.base() as usize;
        let user = align_down(base + total - guard_bytes - size, align);
        debug_assert!(user >= base + guard_bytes + HEADER_SLACK);
        debug_assert!(user + size <= base + total - guard_bytes);

        unsafe {
            let header = (user - HEADER_SIZE) as *mut LargeHeader;
            header.write(LargeHeader {
                vm_base: base,
                total_size: total,
                requested_size: size,
                guard_pages: guards as usize,
                offset_from_base: user - base,
                magic: LARGE_MAGIC,
            });
        }

        self.registry.lock().insert(user);

        // Ownership of the reservation now lives in the header; the region
        // is rebuilt from it at deallocation.
        mem::forget(region);
        NonNull::new(user as *mut u8)
    }

    /// Free a pointer previously returned by `allocate`. The header carries
    /// the true geometry, so `_size` is not trusted.
    ///
    /// # Safety
    /// `p` must be a live large-tier pointer.
    pub unsafe fn deallocate(&self, p: NonNull<u8>, _size: usize) {
        let user = p.as_ptr() as usize;
        let header = ((user - HEADER_SIZE) as *const LargeHeader).read();
        if header.magic != LARGE_MAGIC {
            if cfg!(debug_assertions) {
                debug::corruption("magalloc: large header magic mismatch on deallocate\n");
            }
            log::error!("large deallocate of foreign pointer {:p}, ignoring", p);
            return;
        }
        debug_assert_eq!(header.offset_from_base, user - header.vm_base);

        self.registry.lock().remove(&user);

        let page = vm::page_size();
        let guard_bytes = header.guard_pages * page;
        let mut region = VmRegion::from_raw(header.vm_base as *mut u8, header.total_size);
        region.decommit(guard_bytes, header.total_size - 2 * guard_bytes);
        region.release();
    }

    /// Probe whether `p` belongs to the large tier; if so, free it and
    /// return true. Safe to call with small-tier pointers: when the header
    /// bytes could cross into a preceding (possibly unmapped or guarded)
    /// page, the registry answers instead of a memory read.
    pub fn maybe_deallocate(&self, p: NonNull<u8>) -> bool {
        let user = p.as_ptr() as usize;
        let page = vm::page_size();

        if user % page < HEADER_SIZE {
            if !self.registry.lock().contains(&user) {
                return false;
            }
        } else {
            let magic = unsafe { ((user - HEADER_SIZE) as *const LargeHeader).read().magic };
            if magic != LARGE_MAGIC {
                return false;
            }
        }

        unsafe { self.deallocate(p, 0) };
        true
    }

    /// Requested size recorded for a live large pointer, if `p` is one.
    pub fn requested_size(&self, p: NonNull<u8>) -> Option<usize> {
        let user = p.as_ptr() as usize;
        let page = vm::page_size();
        if user % page < HEADER_SIZE && !self.registry.lock().contains(&user) {
            return None;
        }
        let header = unsafe { &*((user - HEADER_SIZE) as *const LargeHeader) };
        (header.magic == LARGE_MAGIC).then(|| header.requested_size)
    }
}

impl Default for LargeAllocator {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: LazyLock<LargeAllocator> = LazyLock::new(LargeAllocator::new);

/// The process-wide large allocator.
pub fn global() -> &'static LargeAllocator {
    &GLOBAL
}
