//! Per-thread magazines: one stack of cached free pointers per size class,
//! touched only by the owning thread. The thread-local destructor flushes
//! every stack back to the global free lists, so bins cached by a dying
//! thread become visible again before its storage goes away.

use crate::util::MAGAZINE_CAP;
use core::cell::RefCell;
use core::sync::atomic::{AtomicUsize, Ordering};

static CONFIGURED_CLASSES: AtomicUsize = AtomicUsize::new(0);
static CONFIGURED_CAP: AtomicUsize = AtomicUsize::new(MAGAZINE_CAP);

/// Widen future (and, lazily, existing) magazines to at least
/// `max_classes` stacks of `cap` entries. Called once by the binned
/// allocator at startup; engines may raise `cap`.
pub fn configure(max_classes: usize, cap: usize) {
    CONFIGURED_CLASSES.fetch_max(max_classes, Ordering::SeqCst);
    CONFIGURED_CAP.store(cap.max(2), Ordering::SeqCst);
}

pub(crate) struct Magazine {
    stacks: Vec<Vec<*mut u8>>,
    cap: usize,
}

impl Magazine {
    fn new() -> Magazine {
        let classes = CONFIGURED_CLASSES.load(Ordering::SeqCst);
        Magazine {
            stacks: (0..classes).map(|_| Vec::new()).collect(),
            cap: CONFIGURED_CAP.load(Ordering::SeqCst),
        }
    }

    /// Stacks grow lazily so a magazine created before `configure` still
    /// serves every class.
    fn stack_mut(&mut self, class: usize) -> &mut Vec<*mut u8> {
        if class >= self.stacks.len() {
            self.stacks.resize_with(class + 1, Vec::new);
        }
        &mut self.stacks[class]
    }

    pub fn pop(&mut self, class: usize) -> Option<*mut u8> {
        self.stack_mut(class).pop()
    }

    /// Append `p`. When the stack exceeds its cap, the oldest half is
    /// drained and returned for the caller to flush globally; keeping the
    /// most recently freed pointers biases the cache toward hot memory.
    pub fn push(&mut self, class: usize, p: *mut u8) -> Vec<*mut u8> {
        let cap = self.cap;
        let stack = self.stack_mut(class);
        stack.push(p);
        if stack.len() > cap {
            let drain = cap / 2;
            stack.drain(..drain).collect()
        } else {
            Vec::new()
        }
    }

    pub fn flush_all(&mut self, f: &mut dyn FnMut(usize, &[*mut u8])) {
        for (class, stack) in self.stacks.iter_mut().enumerate() {
            if !stack.is_empty() {
                f(class, stack);
                stack.clear();
            }
        }
    }
}

/// The thread-local holder. Only this wrapper flushes on drop, so that a
/// bare `Magazine` stays inert in tests and teardown paths.
struct ThreadMagazine(Magazine);

impl Drop for ThreadMagazine {
    fn drop(&mut self) {
        // Thread exit: hand every cached bin back before the per-thread
        // storage disappears.
        self.0.flush_all(&mut |class, ptrs| {
            crate::binned::global().tls_flush_hook(class, ptrs);
        });
    }
}

thread_local! {
    static MAGAZINE: RefCell<ThreadMagazine> = RefCell::new(ThreadMagazine(Magazine::new()));
}

pub(crate) enum PushOutcome {
    /// Cached; the contained overflow batch (possibly empty) must be
    /// flushed to the global free list.
    Stored(Vec<*mut u8>),
    /// TLS is gone (thread teardown); the caller keeps the pointer.
    Bypassed,
}

pub(crate) fn pop(class: usize) -> Option<*mut u8> {
    MAGAZINE
        .try_with(|m| m.borrow_mut().0.pop(class))
        .ok()
        .flatten()
}

pub(crate) fn push(class: usize, p: *mut u8) -> PushOutcome {
    match MAGAZINE.try_with(|m| m.borrow_mut().0.push(class, p)) {
        Ok(overflow) => PushOutcome::Stored(overflow),
        Err(_) => PushOutcome::Bypassed,
    }
}

/// Drain every stack of the calling thread's magazine. Intended for frame
/// boundaries.
pub(crate) fn flush_current(mut f: impl FnMut(usize, &[*mut u8])) {
    let _ = MAGAZINE.try_with(|m| m.borrow_mut().0.flush_all(&mut f));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake(addr: usize) -> *mut u8 {
        (addr * 16) as *mut u8
    }

    // Direct struct tests: the thread-local instance flushes into the
    // process-wide allocator on drop and must not see fabricated pointers.

    #[test]
    fn lifo_order() {
        let mut mag = Magazine {
            stacks: Vec::new(),
            cap: 8,
        };
        mag.push(3, fake(1));
        mag.push(3, fake(2));
        assert_eq!(mag.pop(3), Some(fake(2)));
        assert_eq!(mag.pop(3), Some(fake(1)));
        assert_eq!(mag.pop(3), None);
    }

    #[test]
    fn overflow_drains_oldest_half() {
        let cap = 8;
        let mut mag = Magazine {
            stacks: Vec::new(),
            cap,
        };
        for i in 1..=cap {
            assert!(mag.push(0, fake(i)).is_empty());
        }
        // The push that exceeds cap spills the oldest cap/2 entries.
        let overflow = mag.push(0, fake(cap + 1));
        assert_eq!(overflow, (1..=cap / 2).map(fake).collect::<Vec<_>>());
        // The newest pointer is still on top.
        assert_eq!(mag.pop(0), Some(fake(cap + 1)));
    }

    #[test]
    fn flush_reports_every_nonempty_class() {
        let mut mag = Magazine {
            stacks: Vec::new(),
            cap: 8,
        };
        mag.push(0, fake(1));
        mag.push(5, fake(2));
        mag.push(5, fake(3));

        let mut seen = Vec::new();
        mag.flush_all(&mut |class, ptrs| seen.push((class, ptrs.len())));
        assert_eq!(seen, vec![(0, 1), (5, 2)]);
        assert_eq!(mag.pop(5), None);
    }
}
