#![no_main]

use libfuzzer_sys::fuzz_target;

/// Interpret the input as a sequence of allocator operations against the
/// process-wide binned allocator.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=allocate, 1=deallocate, 2=flush TLS)
///   byte 1-2: size (little-endian u16)
///   byte 3: alignment exponent (low 4 bits) and slot index
///
/// Up to 16 live pointers are tracked; the paired deallocate always passes
/// the original request size.
const MAX_SLOTS: usize = 16;

fuzz_target!(|data: &[u8]| {
    let alloc = magalloc::global();

    let mut slots: [Option<std::ptr::NonNull<u8>>; MAX_SLOTS] = [None; MAX_SLOTS];
    let mut sizes: [usize; MAX_SLOTS] = [0; MAX_SLOTS];

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] % 3;
        let size = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        let align = 1usize << (data[i + 3] & 0x0F);
        let slot = (data[i + 3] >> 4) as usize % MAX_SLOTS;
        i += 4;

        match opcode {
            0 => {
                if let Some(p) = slots[slot].take() {
                    unsafe { alloc.deallocate(p, sizes[slot]) };
                }
                if let Some(p) = alloc.allocate(size, align) {
                    assert_eq!(p.as_ptr() as usize % align, 0, "misaligned allocation");
                    if size > 0 {
                        unsafe {
                            std::ptr::write_bytes(p.as_ptr(), 0xAA, size.min(256));
                        }
                    }
                    slots[slot] = Some(p);
                    sizes[slot] = size;
                }
            }
            1 => {
                if let Some(p) = slots[slot].take() {
                    unsafe { alloc.deallocate(p, sizes[slot]) };
                    sizes[slot] = 0;
                }
            }
            2 => {
                alloc.flush_tls();
            }
            _ => unreachable!(),
        }
    }

    for (slot, size) in slots.iter_mut().zip(sizes.iter()) {
        if let Some(p) = slot.take() {
            unsafe { alloc.deallocate(p, *size) };
        }
    }
});
