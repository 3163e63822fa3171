//! Delayed-reuse quarantine: a bounded FIFO of freed (pointer, bin size)
//! pairs. While a bin sits in quarantine it is on no free list, so a
//! dangling read or write has a window to land on poisoned memory and be
//! caught. Inert until given a capacity.

#[cfg(feature = "quarantine")]
use parking_lot::Mutex;
#[cfg(feature = "quarantine")]
use std::collections::VecDeque;
#[cfg(feature = "quarantine")]
use std::sync::LazyLock;

pub(crate) enum QuarantineOutcome {
    /// Quarantine is off; the caller frees normally.
    Bypassed,
    /// The pointer was swallowed. If an eviction happened the caller must
    /// recycle the evicted (pointer, bin size) pair -- the quarantine lock
    /// has already been dropped by then, so re-entering the allocator is
    /// safe.
    Held { evicted: Option<(usize, usize)> },
}

#[cfg(feature = "quarantine")]
struct State {
    entries: VecDeque<(usize, usize)>,
    capacity: usize,
}

#[cfg(feature = "quarantine")]
static STATE: LazyLock<Mutex<State>> = LazyLock::new(|| {
    Mutex::new(State {
        entries: VecDeque::new(),
        capacity: 0,
    })
});

/// Set the quarantine capacity; 0 disables it. Shrinking recycles the
/// overflow immediately. Typical debug boot:
/// `set_capacity(magalloc::util::QUARANTINE_CAPACITY)`.
#[cfg(feature = "quarantine")]
pub fn set_capacity(capacity: usize) {
    let overflow: Vec<(usize, usize)> = {
        let mut state = STATE.lock();
        state.capacity = capacity;
        let excess = state.entries.len().saturating_sub(capacity);
        state.entries.drain(..excess).collect()
    };
    // Lock dropped before the evicted bins re-enter the allocator.
    for (ptr, bin_size) in overflow {
        crate::binned::global().free_from_quarantine(ptr, bin_size);
    }
}

#[cfg(not(feature = "quarantine"))]
pub fn set_capacity(_capacity: usize) {}

/// Current number of quarantined bins.
#[cfg(feature = "quarantine")]
pub fn len() -> usize {
    STATE.lock().entries.len()
}

#[cfg(not(feature = "quarantine"))]
pub fn len() -> usize {
    0
}

/// Offer a freed bin to the quarantine.
#[cfg(feature = "quarantine")]
pub(crate) fn push(ptr: usize, bin_size: usize) -> QuarantineOutcome {
    let mut state = STATE.lock();
    if state.capacity == 0 {
        return QuarantineOutcome::Bypassed;
    }
    let evicted = if state.entries.len() >= state.capacity {
        state.entries.pop_front()
    } else {
        None
    };
    state.entries.push_back((ptr, bin_size));
    drop(state);
    QuarantineOutcome::Held { evicted }
}

#[cfg(not(feature = "quarantine"))]
#[inline(always)]
pub(crate) fn push(_ptr: usize, _bin_size: usize) -> QuarantineOutcome {
    QuarantineOutcome::Bypassed
}
