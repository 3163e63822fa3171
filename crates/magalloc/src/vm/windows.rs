use super::Protection;
use core::ffi::c_void;
use core::ptr;

const MEM_COMMIT: u32 = 0x1000;
const MEM_RESERVE: u32 = 0x2000;
const MEM_DECOMMIT: u32 = 0x4000;
const MEM_RELEASE: u32 = 0x8000;

const PAGE_NOACCESS: u32 = 0x01;
const PAGE_READONLY: u32 = 0x02;
const PAGE_READWRITE: u32 = 0x04;

#[repr(C)]
struct SystemInfo {
    processor_arch: u16,
    reserved: u16,
    page_size: u32,
    minimum_application_address: *mut c_void,
    maximum_application_address: *mut c_void,
    active_processor_mask: usize,
    number_of_processors: u32,
    processor_type: u32,
    allocation_granularity: u32,
    processor_level: u16,
    processor_revision: u16,
}

#[link(name = "kernel32")]
extern "system" {
    fn VirtualAlloc(addr: *mut c_void, size: usize, kind: u32, protect: u32) -> *mut c_void;
    fn VirtualFree(addr: *mut c_void, size: usize, kind: u32) -> i32;
    fn VirtualProtect(addr: *mut c_void, size: usize, protect: u32, old: *mut u32) -> i32;
    fn GetSystemInfo(info: *mut SystemInfo);
}

fn system_info() -> (usize, usize) {
    unsafe {
        let mut info = core::mem::zeroed::<SystemInfo>();
        GetSystemInfo(&mut info);
        (
            info.page_size as usize,
            info.allocation_granularity as usize,
        )
    }
}

pub fn page_size() -> usize {
    system_info().0
}

pub fn allocation_granularity() -> usize {
    system_info().1
}

/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn reserve(size: usize) -> *mut u8 {
    VirtualAlloc(ptr::null_mut(), size, MEM_RESERVE, PAGE_NOACCESS) as *mut u8
}

/// Windows cannot partially release a reservation, so the over-reserve +
/// trim approach is replaced by release-and-retry at the aligned base.
///
/// # Safety
/// `size` page-aligned and non-zero, `alignment` a power of two.
pub unsafe fn reserve_aligned(size: usize, alignment: usize) -> *mut u8 {
    for _ in 0..16 {
        let padded = match size.checked_add(alignment) {
            Some(p) => p,
            None => return ptr::null_mut(),
        };
        let probe = VirtualAlloc(ptr::null_mut(), padded, MEM_RESERVE, PAGE_NOACCESS);
        if probe.is_null() {
            return ptr::null_mut();
        }
        let aligned = ((probe as usize) + alignment - 1) & !(alignment - 1);
        VirtualFree(probe, 0, MEM_RELEASE);

        // The aligned address inside the just-released range is usually
        // still free; another thread may race us to it, hence the retry.
        let taken = VirtualAlloc(aligned as *mut c_void, size, MEM_RESERVE, PAGE_NOACCESS);
        if !taken.is_null() {
            return taken as *mut u8;
        }
    }
    ptr::null_mut()
}

/// # Safety
/// `ptr`/`size` must describe a live reservation.
pub unsafe fn release(ptr: *mut u8, _size: usize) {
    let ret = VirtualFree(ptr as *mut c_void, 0, MEM_RELEASE);
    debug_assert!(ret != 0, "VirtualFree(MEM_RELEASE) failed");
    if ret == 0 {
        log::error!("VirtualFree({:p}) failed, leaking address space", ptr);
    }
}

/// # Safety
/// Range must lie inside a reservation and be page-aligned.
pub unsafe fn commit(ptr: *mut u8, size: usize) -> bool {
    !VirtualAlloc(ptr as *mut c_void, size, MEM_COMMIT, PAGE_READWRITE).is_null()
}

/// # Safety
/// Range must lie inside a reservation and be page-aligned.
pub unsafe fn decommit(ptr: *mut u8, size: usize) {
    VirtualFree(ptr as *mut c_void, size, MEM_DECOMMIT);
}

/// # Safety
/// Range must lie inside a reservation and be page-aligned.
pub unsafe fn protect(ptr: *mut u8, size: usize, prot: Protection) -> bool {
    let flags = match prot {
        Protection::NoAccess => PAGE_NOACCESS,
        Protection::Read => PAGE_READONLY,
        Protection::ReadWrite => PAGE_READWRITE,
    };
    let mut old = 0u32;
    VirtualProtect(ptr as *mut c_void, size, flags, &mut old) != 0
}

/// Large pages need SeLockMemoryPrivilege; not worth it for an advice path.
///
/// # Safety
/// Range must lie inside a reservation.
pub unsafe fn advise_huge(_ptr: *mut u8, _size: usize) {}
