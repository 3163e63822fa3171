//! Invariant tests against the process-wide allocator.
//!
//! Tests in this binary run concurrently; every test that reasons about a
//! class's free-bin count uses a size class no other test here touches.

use magalloc::binned::size_class;
use magalloc::util::is_aligned;
use magalloc::{global, vm, LargeAllocator};

/// Every successful allocation is aligned as requested and fully writable.
#[test]
fn alignment_and_commit() {
    let alloc = global();
    let cases: &[(usize, usize)] = &[
        (1, 1),
        (48, 16),
        (96, 32),
        (160, 32),
        (1024, 1024),
        (2048, 16),
        (8192, 16),
        (100_000, 64),
        (64, 8192), // over-aligned: spills large
    ];
    for &(size, align) in cases {
        let p = alloc.allocate(size, align).unwrap();
        assert!(
            is_aligned(p.as_ptr() as usize, align),
            "allocate({}, {}) misaligned",
            size,
            align
        );
        unsafe {
            p.as_ptr().write_bytes(0xC3, size);
            assert_eq!(p.as_ptr().read(), 0xC3);
            if size > 0 {
                assert_eq!(p.as_ptr().add(size - 1).read(), 0xC3);
            }
            alloc.deallocate(p, size);
        }
    }
}

/// Free-bin accounting returns to its pre-allocation state after any
/// permutation of frees (class 352 is exclusive to this test).
#[test]
fn free_bin_conservation_over_permuted_frees() {
    let alloc = global();
    let size = 352;
    let class = size_class::class_for_size(size).unwrap();

    let prime = alloc.allocate(size, 16).unwrap();
    unsafe { alloc.deallocate(prime, size) };
    alloc.flush_tls();
    let baseline = alloc.free_bins(class);

    let mut held: Vec<_> = (0..50)
        .map(|_| alloc.allocate(size, 16).unwrap())
        .collect();
    alloc.flush_tls();
    assert_eq!(alloc.free_bins(class), baseline - 50);

    // A fixed scramble; any order must restore the count.
    for step in [7usize, 13, 1] {
        let mut i = 0;
        while i + step < held.len() {
            held.swap(i, i + step);
            i += step;
        }
    }
    for p in held {
        unsafe { alloc.deallocate(p, size) };
    }
    alloc.flush_tls();
    assert_eq!(alloc.free_bins(class), baseline);
}

/// Alignment beyond the class's natural alignment must route to the large
/// tier, observable through the header magic (probe consumes the pointer).
#[test]
fn alignment_spill_reaches_large_tier() {
    let alloc = global();
    let page = vm::page_size();

    let p = alloc.allocate(64, page).unwrap();
    assert!(is_aligned(p.as_ptr() as usize, page));

    // Non-consuming probe first, then the consuming one acts as the free.
    assert_eq!(magalloc::large::global().requested_size(p), Some(64));
    assert!(magalloc::large::global().maybe_deallocate(p));
}

/// The large probe answers true exactly for large-tier pointers and never
/// faults on small pointers, page-aligned ones included.
#[test]
fn large_probe_is_exact_and_fault_free() {
    let alloc = global();

    // A genuine large pointer probes true (and is consumed).
    let big = alloc.allocate(16 * 1024, 16).unwrap();
    assert!(magalloc::large::global().maybe_deallocate(big));

    // Small-tier pointers probe false. A 16-byte class block starts
    // page-aligned, so scanning a batch is guaranteed to cover pointers
    // with addr % page < header size.
    let mut small: Vec<_> = (0..512)
        .map(|_| alloc.allocate(16, 16).unwrap())
        .collect();
    let near_boundary = small
        .iter()
        .filter(|p| (p.as_ptr() as usize) % vm::page_size() < 64)
        .count();
    assert!(near_boundary > 0, "no page-straddling sample in batch");
    for p in &small {
        assert!(!magalloc::large::global().maybe_deallocate(*p));
    }
    for p in small.drain(..) {
        unsafe { alloc.deallocate(p, 16) };
    }
}

/// S1: a hot small round-trip must not grow past a single block.
#[test]
fn small_round_trip_stays_within_one_block() {
    let alloc = global();
    let class = size_class::class_for_size(24).unwrap();
    assert_eq!(alloc.bin_size_of(class), 32);
    let bins_per_block = size_class::block_bytes(class) / 32;

    for _ in 0..100_000 {
        let p = alloc.allocate(24, 16).unwrap();
        assert!(is_aligned(p.as_ptr() as usize, 16));
        unsafe { alloc.deallocate(p, 24) };
    }

    alloc.flush_tls();
    let free = alloc.free_bins(class);
    assert!(free > 0);
    assert!(
        free <= bins_per_block,
        "class grew beyond one block: {} free bins",
        free
    );
}

/// Direct large-tier use: geometry, content integrity, probe round trip.
#[test]
fn large_allocator_direct_use() {
    let alloc = LargeAllocator::new();
    let page = vm::page_size();

    let p = alloc.allocate_with_guards(page * 2, 16, true).unwrap();
    unsafe {
        p.as_ptr().write_bytes(0x7E, page * 2);
        assert_eq!(p.as_ptr().add(page * 2 - 1).read(), 0x7E);
    }
    assert_eq!(alloc.requested_size(p), Some(page * 2));
    unsafe { alloc.deallocate(p, page * 2) };
}

/// Arena pointers are strictly increasing within a frame and restart at
/// the base after a reset.
#[test]
fn arena_monotonic_and_reset() {
    let mut arena = magalloc::Arena::with_capacity(1 << 22).unwrap();
    let mut previous = 0usize;
    let mut first = 0usize;
    for i in 0..256 {
        let p = arena.alloc(100, 16).unwrap().as_ptr() as usize;
        if i == 0 {
            first = p;
        }
        assert!(p > previous);
        previous = p;
    }
    arena.reset();
    assert_eq!(arena.alloc(100, 16).unwrap().as_ptr() as usize, first);
}

#[cfg(feature = "leak-tracking")]
#[test]
fn live_allocations_show_up_in_the_leak_dump() {
    let alloc = global();
    let p = alloc.allocate(464, 16).unwrap();
    assert!(magalloc::debug::dump_leaks() >= 1);
    unsafe { alloc.deallocate(p, 464) };
}

/// Counters only ever move forward and track the traffic of this test.
#[test]
fn counters_advance() {
    let before = magalloc::debug::counters();
    let alloc = global();
    let p = alloc.allocate(4032, 16).unwrap();
    unsafe { alloc.deallocate(p, 4032) };
    let after = magalloc::debug::counters();
    assert!(after.allocs > before.allocs);
    assert!(after.frees > before.frees);
    assert!(after.commits >= before.commits);
}
