//! Attacker-side memory primitives, current process only.
//!
//! The remote side of a hijack is never touched from here; remote writes go
//! through the captured thread. Callers are responsible for passing
//! addresses that are actually mapped.

use winapi::shared::minwindef::FALSE;
use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE};

pub fn read(address: u64, len: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; len];

    unsafe {
        core::ptr::copy_nonoverlapping(address as *const u8, buffer.as_mut_ptr(), len);
    }

    buffer
}

pub fn write(address: u64, data: &[u8]) -> usize {
    unsafe {
        core::ptr::copy_nonoverlapping(data.as_ptr(), address as *mut u8, data.len());
    }

    data.len()
}

pub fn write_with_pointer(dest: u64, source: u64, size: usize) -> usize {
    unsafe {
        core::ptr::copy(source as *const u8, dest as *mut u8, size);
    }

    size
}

/// Allocates zero-initialised read-write pages.
pub fn alloc(size: usize) -> Option<u64> {
    let memory = unsafe {
        VirtualAlloc(
            core::ptr::null_mut(),
            size,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        )
    };
    if memory.is_null() {
        log::warn!("VirtualAlloc of {:#x} bytes failed", size);
        return None;
    }

    Some(memory as u64)
}

pub fn free(address: u64) -> bool {
    unsafe { VirtualFree(address as *mut _, 0, MEM_RELEASE) != FALSE }
}
