//! Double-free and leak tracking.
//!
//! The freed-set holds every small/large address currently considered
//! free; inserting an address that is already present is a double free.
//! The leak map records live allocations with their origin so survivors
//! can be enumerated at shutdown.

#[cfg(any(feature = "double-free-detection", feature = "leak-tracking"))]
use parking_lot::Mutex;
#[cfg(any(feature = "double-free-detection", feature = "leak-tracking"))]
use std::sync::LazyLock;

use std::panic::Location;

#[derive(Debug, Clone, Copy)]
pub struct LeakRecord {
    pub size: usize,
    pub location: &'static Location<'static>,
}

#[cfg(feature = "double-free-detection")]
static FREED: LazyLock<Mutex<ahash::AHashSet<usize>>> =
    LazyLock::new(|| Mutex::new(ahash::AHashSet::new()));

#[cfg(feature = "leak-tracking")]
static LIVE: LazyLock<Mutex<ahash::AHashMap<usize, LeakRecord>>> =
    LazyLock::new(|| Mutex::new(ahash::AHashMap::new()));

/// Record `addr` as freed; aborts if it already was.
#[cfg(feature = "double-free-detection")]
pub(crate) fn check_double_free(addr: usize) {
    if !FREED.lock().insert(addr) {
        super::corruption("magalloc: double free detected\n");
    }
}

#[cfg(not(feature = "double-free-detection"))]
#[inline(always)]
pub(crate) fn check_double_free(_addr: usize) {}

/// An address is live again; drop it from the freed-set.
#[cfg(feature = "double-free-detection")]
pub(crate) fn note_reuse(addr: usize) {
    FREED.lock().remove(&addr);
}

#[cfg(not(feature = "double-free-detection"))]
#[inline(always)]
pub(crate) fn note_reuse(_addr: usize) {}

#[cfg(feature = "leak-tracking")]
pub(crate) fn tag_alloc(addr: usize, size: usize, location: &'static Location<'static>) {
    LIVE.lock().insert(addr, LeakRecord { size, location });
}

#[cfg(not(feature = "leak-tracking"))]
#[inline(always)]
pub(crate) fn tag_alloc(_addr: usize, _size: usize, _location: &'static Location<'static>) {}

#[cfg(feature = "leak-tracking")]
pub(crate) fn tag_free(addr: usize) {
    LIVE.lock().remove(&addr);
}

#[cfg(not(feature = "leak-tracking"))]
#[inline(always)]
pub(crate) fn tag_free(_addr: usize) {}

/// Log every still-live allocation and return how many there were.
/// Intended for process shutdown.
#[cfg(feature = "leak-tracking")]
pub fn dump_leaks() -> usize {
    let live = LIVE.lock();
    for (addr, record) in live.iter() {
        log::warn!(
            "leaked {} bytes at {:#x}, allocated at {}:{}",
            record.size,
            addr,
            record.location.file(),
            record.location.line(),
        );
    }
    live.len()
}

#[cfg(not(feature = "leak-tracking"))]
pub fn dump_leaks() -> usize {
    0
}

#[cfg(all(test, feature = "leak-tracking"))]
mod tests {
    use super::*;

    #[test]
    fn tag_and_release() {
        let loc = Location::caller();
        // Addresses no allocator will ever produce in this test binary.
        tag_alloc(0x1000_0000_0001, 64, loc);
        tag_alloc(0x1000_0000_0002, 32, loc);
        assert!(dump_leaks() >= 2);
        tag_free(0x1000_0000_0001);
        tag_free(0x1000_0000_0002);
    }
}
