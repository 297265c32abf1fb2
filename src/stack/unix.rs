use core::ptr::{self, NonNull};
use std::io::{Error, Result};

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Maps `len` bytes of private anonymous read/write memory.
pub fn map(len: usize) -> Result<NonNull<u8>> {
    // OpenBSD requires MAP_STACK on anything that is used as a stack.
    cfg_if::cfg_if! {
        if #[cfg(target_os = "openbsd")] {
            let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
        } else {
            let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
        }
    }

    let mmap = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            map_flags,
            -1,
            0,
        )
    };
    if mmap == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }
    NonNull::new(mmap.cast::<u8>()).ok_or_else(Error::last_os_error)
}

/// Makes `len` bytes starting at `base` inaccessible.
pub unsafe fn protect_none(base: NonNull<u8>, len: usize) -> Result<()> {
    if libc::mprotect(base.as_ptr().cast(), len, libc::PROT_NONE) != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

pub unsafe fn unmap(base: NonNull<u8>, len: usize) -> Result<()> {
    if libc::munmap(base.as_ptr().cast(), len) != 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}
