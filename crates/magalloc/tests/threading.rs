//! Multi-thread behavior: magazine flush at thread exit, contention
//! stress, cross-thread frees. Classes used for bin accounting (16 and 48
//! byte bins) are exclusive to the tests that count them.

use magalloc::binned::size_class;
use magalloc::global;
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

/// Wrapper to move raw pointers between threads. The allocator itself is
/// thread-safe; only ownership moves.
#[derive(Clone, Copy)]
struct SendPtr(*mut u8);
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

/// S4: bins cached by a dying thread's magazine must reappear on the
/// global free list, and the next allocations reuse those exact bins
/// before any new growth.
#[test]
fn thread_exit_flushes_magazine_to_global() {
    let alloc = global();

    let worker = thread::spawn(move || {
        let alloc = global();
        let mut ptrs = Vec::new();
        for _ in 0..10 {
            ptrs.push(SendPtr(alloc.allocate(16, 16).unwrap().as_ptr()));
        }
        for p in &ptrs {
            unsafe { alloc.deallocate(std::ptr::NonNull::new(p.0).unwrap(), 16) };
        }
        // The frees above sit in this thread's magazine; the thread-exit
        // destructor flushes them.
        ptrs.iter().map(|p| p.0 as usize).collect::<Vec<_>>()
    });
    let freed: HashSet<usize> = worker.join().unwrap().into_iter().collect();
    assert_eq!(freed.len(), 10);

    // The flush pushed those bins last, so they are on top of the global
    // LIFO: the main thread gets them back before anything else.
    let mut reused = Vec::new();
    for _ in 0..10 {
        let p = alloc.allocate(16, 16).unwrap();
        assert!(
            freed.contains(&(p.as_ptr() as usize)),
            "expected a bin flushed by the exited thread"
        );
        reused.push(p);
    }
    for p in reused {
        unsafe { alloc.deallocate(p, 16) };
    }
}

/// Property 5: after K threads each alloc+free M bins and exit, every
/// touched bin is back on the global list -- the count is a whole number
/// of blocks.
#[test]
fn all_bins_return_after_worker_exit() {
    let alloc = global();
    const THREADS: usize = 8;
    const PER_THREAD: usize = 200;
    let size = 48;
    let class = size_class::class_for_size(size).unwrap();
    let bins_per_block = size_class::block_bytes(class) / size;

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let alloc = global();
                barrier.wait();
                for _ in 0..PER_THREAD {
                    let mut batch = Vec::new();
                    for _ in 0..8 {
                        batch.push(SendPtr(alloc.allocate(size, 16).unwrap().as_ptr()));
                    }
                    for p in batch {
                        unsafe {
                            alloc.deallocate(std::ptr::NonNull::new(p.0).unwrap(), size)
                        };
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("worker panicked");
    }

    // Workers are gone, their magazines flushed; nothing of this class is
    // outstanding.
    let free = alloc.free_bins(class);
    assert!(free > 0);
    assert_eq!(
        free % bins_per_block,
        0,
        "outstanding bins after thread exit: {} (block = {})",
        free,
        bins_per_block
    );
}

#[test]
fn stress_alloc_free_under_contention() {
    const THREADS: usize = 8;
    const ITERATIONS: usize = 10_000;
    const SIZE: usize = 128;

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let alloc = global();
                let pattern = (tid + 1) as u8;
                barrier.wait();
                for _ in 0..ITERATIONS {
                    let p = alloc.allocate(SIZE, 16).unwrap();
                    unsafe {
                        p.as_ptr().write_bytes(pattern, SIZE);
                        let slice = std::slice::from_raw_parts(p.as_ptr(), SIZE);
                        assert!(
                            slice.iter().all(|&b| b == pattern),
                            "data corruption in thread {}",
                            tid
                        );
                        alloc.deallocate(p, SIZE);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("stress thread panicked");
    }
}

#[test]
fn various_sizes_under_contention() {
    const THREADS: usize = 8;
    const SIZES: [usize; 8] = [96, 256, 512, 640, 1024, 2048, 4096, 16384];

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let alloc = global();
                let size = SIZES[tid % SIZES.len()];
                barrier.wait();
                for _ in 0..500 {
                    let p = alloc.allocate(size, 16).unwrap();
                    unsafe {
                        p.as_ptr().write_bytes(0xEE, size);
                        assert_eq!(p.as_ptr().add(size - 1).read(), 0xEE);
                        alloc.deallocate(p, size);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("thread panicked");
    }
}

/// One thread allocates, another frees: the free lands in the consumer's
/// magazine or the global list, never corrupting either.
#[test]
fn cross_thread_free() {
    const COUNT: usize = 1_000;
    const SIZE: usize = 192;

    let (tx, rx) = std::sync::mpsc::channel::<SendPtr>();

    let producer = thread::spawn(move || {
        let alloc = global();
        for _ in 0..COUNT {
            let p = alloc.allocate(SIZE, 16).unwrap();
            unsafe { p.as_ptr().write_bytes(0xAB, SIZE) };
            tx.send(SendPtr(p.as_ptr())).unwrap();
        }
    });

    let consumer = thread::spawn(move || {
        let alloc = global();
        let mut freed = 0;
        while let Ok(sp) = rx.recv() {
            unsafe { alloc.deallocate(std::ptr::NonNull::new(sp.0).unwrap(), SIZE) };
            freed += 1;
        }
        freed
    });

    producer.join().expect("producer panicked");
    assert_eq!(consumer.join().expect("consumer panicked"), COUNT);
}

/// Frame-boundary flush drains the calling thread's magazine.
#[test]
fn flush_tls_returns_cached_bins() {
    let alloc = global();
    let size = 3904; // class exclusive to this test
    let class = size_class::class_for_size(size).unwrap();

    let p = alloc.allocate(size, 16).unwrap();
    unsafe { alloc.deallocate(p, size) };
    // The bin sits in this thread's magazine.
    alloc.flush_tls();
    let after_flush = alloc.free_bins(class);

    // Every bin of the grown block is accounted for on the global list.
    assert_eq!(
        after_flush,
        size_class::block_bytes(class) / size_class::bin_size(class)
    );
}
