//! Binned small tier: fixed size classes, a global intrusive free list per
//! class, per-thread magazines in front of it, and block growth gated by an
//! exponential backoff under memory pressure.
//!
//! Free-list push/pop and growth are serialized by the per-class grow lock
//! (an atomic flag with an OS yield); growth is already funneled through it
//! and the free-list critical section is a handful of instructions, so one
//! lock covers both without a tagged-pointer scheme.

pub mod size_class;

mod block;

use self::block::Block;
pub use self::size_class::NUM_SIZE_CLASSES;
use crate::debug::{self, quarantine::QuarantineOutcome};
use crate::large;
use crate::magazine::{self, PushOutcome};
use crate::util::{
    now_monotonic_ns, BACKOFF_BASE_NS, BACKOFF_CAP_NS, BACKOFF_EXP_MAX, MAGAZINE_CAP,
};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use parking_lot::Mutex;
use std::panic::Location;
use std::sync::{Arc, LazyLock};
use std::thread;

struct ClassState {
    bin_size: usize,
    /// Head of the intrusive LIFO free list; each free bin stores the next
    /// address in its first word. 0 = empty. Mutated only under `lock`.
    free_head: AtomicUsize,
    free_bins: AtomicUsize,
    /// Grow lock; also serializes free-list mutation.
    lock: AtomicBool,
    exhausted: AtomicBool,
    backoff_exp: AtomicU32,
    grow_deadline_ns: AtomicU64,
    /// Append-only; blocks live until process exit.
    blocks: Mutex<Vec<Block>>,
}

impl ClassState {
    fn new(bin_size: usize) -> ClassState {
        ClassState {
            bin_size,
            free_head: AtomicUsize::new(0),
            free_bins: AtomicUsize::new(0),
            lock: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            backoff_exp: AtomicU32::new(0),
            grow_deadline_ns: AtomicU64::new(0),
            blocks: Mutex::new(Vec::new()),
        }
    }

    fn acquire(&self) {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            thread::yield_now();
        }
    }

    fn try_acquire(&self) -> bool {
        self.lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }

    /// Push with the lock already held (grow carving).
    ///
    /// # Safety
    /// `addr` must be a bin of this class, writable, lock held.
    unsafe fn push_locked(&self, addr: usize) {
        let head = self.free_head.load(Ordering::Relaxed);
        (addr as *mut usize).write(head);
        self.free_head.store(addr, Ordering::Release);
        self.free_bins.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a bin to the global free list.
    ///
    /// # Safety
    /// `addr` must be a free bin of this class, owned by the caller.
    unsafe fn push_free(&self, addr: usize) {
        #[cfg(debug_assertions)]
        {
            let blocks = self.blocks.lock();
            debug_assert!(
                blocks
                    .iter()
                    .any(|b| b.contains(addr) && (addr - b.base() as usize) % self.bin_size == 0),
                "free-list push of a pointer outside this class's blocks"
            );
        }
        self.acquire();
        self.push_locked(addr);
        self.unlock();
    }

    fn pop_free(&self) -> Option<*mut u8> {
        // Empty list needs no lock.
        if self.free_head.load(Ordering::Acquire) == 0 {
            return None;
        }
        self.acquire();
        let head = self.free_head.load(Ordering::Relaxed);
        let result = if head == 0 {
            None
        } else {
            let next = unsafe { (head as *const usize).read() };
            self.free_head.store(next, Ordering::Release);
            self.free_bins.fetch_sub(1, Ordering::Relaxed);
            Some(head as *mut u8)
        };
        self.unlock();
        result
    }

    fn should_attempt_grow(&self, now: u64) -> bool {
        !self.exhausted.load(Ordering::SeqCst) || now >= self.grow_deadline_ns.load(Ordering::SeqCst)
    }

    fn record_grow_success(&self) {
        self.exhausted.store(false, Ordering::SeqCst);
        self.backoff_exp.store(0, Ordering::SeqCst);
        self.grow_deadline_ns.store(0, Ordering::SeqCst);
    }

    fn record_grow_failure(&self) {
        self.exhausted.store(true, Ordering::SeqCst);
        let prev = self
            .backoff_exp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |e| {
                Some((e + 1).min(BACKOFF_EXP_MAX))
            })
            .unwrap_or(0);
        let exp = (prev + 1).min(BACKOFF_EXP_MAX);
        let delay = BACKOFF_CAP_NS.min(BACKOFF_BASE_NS << exp);
        self.grow_deadline_ns
            .store(now_monotonic_ns() + delay, Ordering::SeqCst);
    }
}

pub struct BinnedAllocator {
    classes: Vec<ClassState>,
    use_magazines: bool,
    pressure_handler: Mutex<Option<Arc<dyn Fn(usize) + Send + Sync>>>,
}

impl BinnedAllocator {
    fn with_magazines(use_magazines: bool) -> BinnedAllocator {
        if use_magazines {
            magazine::configure(NUM_SIZE_CLASSES, MAGAZINE_CAP);
        }
        BinnedAllocator {
            classes: size_class::BIN_SIZES.iter().map(|&s| ClassState::new(s)).collect(),
            use_magazines,
            pressure_handler: Mutex::new(None),
        }
    }

    /// Instance without thread-magazine caching; the process-wide magazines
    /// belong to the global allocator.
    #[cfg(test)]
    pub(crate) fn standalone() -> BinnedAllocator {
        Self::with_magazines(false)
    }

    /// Allocate `size` bytes at `align` (a power of two). Small requests
    /// whose alignment fits the class's natural alignment come from the
    /// bins; everything else spills to the large tier. None means transient
    /// inability: OOM or growth backoff.
    #[track_caller]
    pub fn allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        let location = Location::caller();

        let class = match size_class::class_for_size(size) {
            Some(c) if align <= size_class::natural_alignment(c) => c,
            _ => return self.allocate_large(size, align, location),
        };

        if self.use_magazines {
            if let Some(p) = magazine::pop(class) {
                return Some(self.finish_small_alloc(p, size, location));
            }
        }
        if let Some(p) = self.classes[class].pop_free() {
            return Some(self.finish_small_alloc(p, size, location));
        }

        if self.classes[class].should_attempt_grow(now_monotonic_ns()) {
            if !self.grow(class) {
                return None;
            }
            if let Some(p) = self.classes[class].pop_free() {
                return Some(self.finish_small_alloc(p, size, location));
            }
        }
        None
    }

    fn finish_small_alloc(
        &self,
        p: *mut u8,
        size: usize,
        location: &'static Location<'static>,
    ) -> NonNull<u8> {
        unsafe { debug::screen_reused_bin(p) };
        debug::track::note_reuse(p as usize);
        debug::track::tag_alloc(p as usize, size, location);
        debug::count_alloc();
        // Bins are never at address zero.
        unsafe { NonNull::new_unchecked(p) }
    }

    fn allocate_large(
        &self,
        size: usize,
        align: usize,
        location: &'static Location<'static>,
    ) -> Option<NonNull<u8>> {
        let p = large::global().allocate(size, align)?;
        debug::track::note_reuse(p.as_ptr() as usize);
        debug::track::tag_alloc(p.as_ptr() as usize, size, location);
        debug::count_alloc();
        Some(p)
    }

    /// Free `p`, which must have come from `allocate` with the same `size`
    /// (the large tier ignores `size`; its header carries the truth).
    ///
    /// # Safety
    /// `p` must be live and owned by this allocator; freeing it twice or
    /// with a different size is a caller error (debug builds catch the
    /// former).
    pub unsafe fn deallocate(&self, p: NonNull<u8>, size: usize) {
        let addr = p.as_ptr() as usize;
        debug::track::check_double_free(addr);
        debug::count_free();

        if large::global().maybe_deallocate(p) {
            debug::track::tag_free(addr);
            return;
        }

        let class = match size_class::class_for_size(size) {
            Some(c) => c,
            None => {
                // The large probe said no and the size is not small:
                // the pointer was never ours.
                if cfg!(debug_assertions) {
                    debug::corruption("magalloc: deallocate of foreign pointer\n");
                }
                log::error!("deallocate of foreign pointer {:p} (size {})", p, size);
                return;
            }
        };
        let state = &self.classes[class];

        debug::poison_bin(p.as_ptr(), state.bin_size);

        match debug::quarantine::push(addr, state.bin_size) {
            QuarantineOutcome::Held { evicted } => {
                // The quarantine lock is already released here.
                if let Some((evicted_ptr, evicted_bin)) = evicted {
                    self.free_from_quarantine(evicted_ptr, evicted_bin);
                }
                debug::track::tag_free(addr);
                return;
            }
            QuarantineOutcome::Bypassed => {}
        }

        if self.use_magazines {
            match magazine::push(class, p.as_ptr()) {
                PushOutcome::Stored(overflow) => {
                    for q in overflow {
                        state.push_free(q as usize);
                    }
                }
                PushOutcome::Bypassed => state.push_free(addr),
            }
        } else {
            state.push_free(addr);
        }

        debug::track::tag_free(addr);
    }

    /// Recycle a quarantine-evicted bin straight onto its class's free
    /// list, bypassing the normal deallocate path (no double-free insert,
    /// no re-quarantine).
    pub(crate) fn free_from_quarantine(&self, ptr: usize, bin_size: usize) {
        match size_class::class_for_bin_size(bin_size) {
            Some(class) => unsafe { self.classes[class].push_free(ptr) },
            None => debug_assert!(false, "quarantine evicted an unknown bin size"),
        }
    }

    /// Cross-thread entry used by magazines during thread exit (and by
    /// `flush_tls`): hand a batch of bins back to a class's free list.
    pub fn tls_flush_hook(&self, class: usize, ptrs: &[*mut u8]) {
        if class >= self.classes.len() {
            debug_assert!(false, "flush for out-of-range class {}", class);
            return;
        }
        for &p in ptrs {
            unsafe { self.classes[class].push_free(p as usize) };
        }
    }

    /// Drain the calling thread's magazine. Intended for frame boundaries.
    pub fn flush_tls(&self) {
        magazine::flush_current(|class, ptrs| self.tls_flush_hook(class, ptrs));
    }

    fn grow(&self, class: usize) -> bool {
        let state = &self.classes[class];
        if !state.try_acquire() {
            // Another thread holds the lock and is (or just was) growing;
            // report success and let the caller retry the free list.
            return true;
        }

        match Block::carve(class) {
            Ok(new_block) => {
                unsafe {
                    for i in 0..new_block.bin_count() {
                        let bin = new_block.bin_at(i);
                        debug::poison_bin(bin, new_block.bin_size());
                        state.push_locked(bin as usize);
                    }
                }
                let bins = new_block.bin_count();
                state.blocks.lock().push(new_block);
                state.record_grow_success();
                state.unlock();
                log::debug!("bin {}: grew by {} bins", state.bin_size, bins);
                true
            }
            Err(err) => {
                state.record_grow_failure();
                state.unlock();
                log::warn!("bin {}: block growth failed: {}", state.bin_size, err);
                self.invoke_pressure_handler(state.bin_size);
                false
            }
        }
    }

    /// Install a handler invoked (with the starved bin size) whenever
    /// growth fails. Replaces any previous handler.
    pub fn set_memory_pressure_handler(
        &self,
        handler: impl Fn(usize) + Send + Sync + 'static,
    ) {
        *self.pressure_handler.lock() = Some(Arc::new(handler));
    }

    pub fn clear_memory_pressure_handler(&self) {
        *self.pressure_handler.lock() = None;
    }

    fn invoke_pressure_handler(&self, bin_size: usize) {
        // Clone out of the mutex so the handler runs without any allocator
        // lock held.
        let handler = self.pressure_handler.lock().clone();
        if let Some(handler) = handler {
            handler(bin_size);
        }
    }

    #[inline]
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Bins currently on the class's global free list (magazine-cached
    /// bins are not included; `flush_tls` first for exact accounting).
    pub fn free_bins(&self, class: usize) -> usize {
        self.classes[class].free_bins.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn bin_size_of(&self, class: usize) -> usize {
        self.classes[class].bin_size
    }
}

static GLOBAL: LazyLock<BinnedAllocator> = LazyLock::new(|| BinnedAllocator::with_magazines(true));

/// The process-wide binned allocator.
pub fn global() -> &'static BinnedAllocator {
    &GLOBAL
}
