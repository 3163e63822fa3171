//! Debug instrumentation: poison fill, delayed-reuse quarantine,
//! double-free and leak tracking, allocation counters. Every mechanism is
//! feature-gated and compiles to a cheap no-op when disabled; none of the
//! locks here may be held across a call back into the allocator, except
//! the documented quarantine eviction path.

pub mod quarantine;
pub mod track;

pub use track::{dump_leaks, LeakRecord};

use core::sync::atomic::{AtomicU64, Ordering};

static ALLOCS: AtomicU64 = AtomicU64::new(0);
static FREES: AtomicU64 = AtomicU64::new(0);
static COMMITS: AtomicU64 = AtomicU64::new(0);
static DECOMMITS: AtomicU64 = AtomicU64::new(0);

/// Snapshot of the process-wide operation counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub allocs: u64,
    pub frees: u64,
    pub commits: u64,
    pub decommits: u64,
}

pub fn counters() -> Counters {
    Counters {
        allocs: ALLOCS.load(Ordering::Relaxed),
        frees: FREES.load(Ordering::Relaxed),
        commits: COMMITS.load(Ordering::Relaxed),
        decommits: DECOMMITS.load(Ordering::Relaxed),
    }
}

#[inline]
pub(crate) fn count_alloc() {
    ALLOCS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn count_free() {
    FREES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn count_commit() {
    COMMITS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn count_decommit() {
    DECOMMITS.fetch_add(1, Ordering::Relaxed);
}

/// Fill a freed bin with the poison byte.
///
/// # Safety
/// `ptr` must be writable for `len` bytes.
#[cfg(feature = "poison-on-free")]
#[inline]
pub(crate) unsafe fn poison_bin(ptr: *mut u8, len: usize) {
    core::ptr::write_bytes(ptr, crate::util::POISON_BYTE, len);
}

#[cfg(not(feature = "poison-on-free"))]
#[inline(always)]
pub(crate) unsafe fn poison_bin(_ptr: *mut u8, _len: usize) {}

/// Screen a bin coming back out of a cache for the use-after-free
/// sentinel. The first byte never legitimately holds the sentinel: free
/// bins carry either poison or an aligned free-list link there.
///
/// # Safety
/// `ptr` must be readable.
#[cfg(feature = "poison-on-free")]
#[inline]
pub(crate) unsafe fn screen_reused_bin(ptr: *const u8) {
    if ptr.read() == crate::util::UAF_BYTE {
        corruption("magalloc: use-after-free pattern in recycled bin\n");
    }
}

#[cfg(not(feature = "poison-on-free"))]
#[inline(always)]
pub(crate) unsafe fn screen_reused_bin(_ptr: *const u8) {}

/// Abort with a diagnostic on detected heap corruption. Writes straight to
/// stderr: the corruption path must not allocate.
#[cold]
#[inline(never)]
pub(crate) fn corruption(msg: &str) -> ! {
    #[cfg(unix)]
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::abort();
    }
    #[cfg(not(unix))]
    {
        eprintln!("{}", msg);
        std::process::abort();
    }
}
