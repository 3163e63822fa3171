use super::Protection;
use core::ptr;

pub fn page_size() -> usize {
    unsafe {
        let n = libc::sysconf(libc::_SC_PAGESIZE);
        if n < 1 {
            4096
        } else {
            n as usize
        }
    }
}

pub fn allocation_granularity() -> usize {
    page_size()
}

/// Reserve no-access address space.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn reserve(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Reserve with a base alignment above the allocation granularity:
/// over-reserve by `alignment`, align the base up, unmap head and tail
/// slack.
///
/// # Safety
/// `size` page-aligned and non-zero, `alignment` a power of two.
pub unsafe fn reserve_aligned(size: usize, alignment: usize) -> *mut u8 {
    let padded = match size.checked_add(alignment) {
        Some(p) => p,
        None => return ptr::null_mut(),
    };
    let raw = reserve(padded);
    if raw.is_null() {
        return ptr::null_mut();
    }

    let addr = raw as usize;
    let aligned = (addr + alignment - 1) & !(alignment - 1);
    let head = aligned - addr;
    let tail = padded - head - size;

    if head > 0 {
        libc::munmap(raw as *mut libc::c_void, head);
    }
    if tail > 0 {
        libc::munmap((aligned + size) as *mut libc::c_void, tail);
    }
    aligned as *mut u8
}

/// # Safety
/// `ptr`/`size` must describe a live reservation.
pub unsafe fn release(ptr: *mut u8, size: usize) {
    let ret = libc::munmap(ptr as *mut libc::c_void, size);
    debug_assert!(ret == 0, "munmap failed");
    if ret != 0 {
        log::error!("munmap({:p}, {}) failed, leaking address space", ptr, size);
    }
}

/// # Safety
/// Range must lie inside a reservation and be page-aligned.
pub unsafe fn commit(ptr: *mut u8, size: usize) -> bool {
    libc::mprotect(
        ptr as *mut libc::c_void,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
    ) == 0
}

/// Drop protection and tell the kernel the pages can be reclaimed.
/// MADV_DONTNEED guarantees zero-filled pages on the next commit.
///
/// # Safety
/// Range must lie inside a reservation and be page-aligned.
pub unsafe fn decommit(ptr: *mut u8, size: usize) {
    // madvise requires readable pages on some kernels when combined with
    // other flags, but DONTNEED works on PROT_NONE ranges; order it first
    // so the reclaim hint applies to the still-mapped backing.
    libc::madvise(ptr as *mut libc::c_void, size, libc::MADV_DONTNEED);
    libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_NONE);
}

/// # Safety
/// Range must lie inside a reservation and be page-aligned.
pub unsafe fn protect(ptr: *mut u8, size: usize, prot: Protection) -> bool {
    let flags = match prot {
        Protection::NoAccess => libc::PROT_NONE,
        Protection::Read => libc::PROT_READ,
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    };
    libc::mprotect(ptr as *mut libc::c_void, size, flags) == 0
}

/// Best-effort transparent-huge-page advice. Never fatal.
///
/// # Safety
/// Range must lie inside a reservation and be page-aligned.
pub unsafe fn advise_huge(ptr: *mut u8, size: usize) {
    libc::madvise(ptr as *mut libc::c_void, size, libc::MADV_HUGEPAGE);
}
