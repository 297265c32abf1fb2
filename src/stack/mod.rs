//! Guard-paged memory regions used as coroutine stacks.
//!
//! A region is a single private anonymous mapping. Its lowest page is the
//! guard page and is mapped inaccessible, so a coroutine that overflows its
//! stack (which grows downwards) faults instead of scribbling over whatever
//! happens to be mapped below it.
//!
//! ```text
//! +--------------+  <- top()
//! |              |
//! ~ usable pages ~
//! |              |
//! +--------------+  <- usable_low()
//! | Guard page   |
//! +--------------+  <- base()
//! ```

use core::num::NonZeroUsize;
use core::ops::Range;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{Error, Result};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        use self::unix as sys;
    } else {
        compile_error!("Unsupported target");
    }
}

/// Type to represent a stack address.
pub type StackPointer = NonZeroUsize;

/// Required stack alignment at function call boundaries.
pub const STACK_ALIGNMENT: usize = crate::arch::STACK_ALIGNMENT;

/// Largest stack, excluding the guard page, that may be requested.
pub const MAX_STACK_SIZE: usize = 0x10_0000;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Returns the page size of the underlying OS.
///
/// The value is queried once and cached.
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let pagesize = sys::page_size();
    assert!(pagesize.is_power_of_two());
    PAGE_SIZE.store(pagesize, Ordering::Relaxed);
    pagesize
}

/// Computes the total mapping length for a request: the request rounded up to
/// whole pages (at least one), plus the guard page.
fn mapping_len(requested: usize, page_size: usize) -> Result<usize> {
    if requested > MAX_STACK_SIZE {
        return Err(Error::StackTooLarge { requested });
    }
    let usable = requested.max(page_size);
    let usable = (usable + page_size - 1) & !(page_size - 1);
    Ok(usable + page_size)
}

/// An owned guard-paged memory region.
///
/// The region is not unmapped on drop: whoever owns it must hand it back with
/// [`GuardedRegion::release`]. This lets the region live inside the memory it
/// describes.
#[derive(Debug)]
pub struct GuardedRegion {
    base: NonNull<u8>,
    len: usize,
}

impl GuardedRegion {
    /// Maps a new region with at least `requested` usable bytes above a guard
    /// page.
    ///
    /// A request of zero or less than a page gets a single usable page.
    /// Requests larger than [`MAX_STACK_SIZE`] fail with
    /// [`Error::StackTooLarge`] without touching the OS.
    pub fn reserve(requested: usize) -> Result<Self> {
        let page_size = page_size();
        let len = mapping_len(requested, page_size)?;

        let base = sys::map(len).map_err(Error::OutOfMemory)?;

        // Unmap again if the guard page cannot be protected.
        let mapping = scopeguard::guard(base, |base| unsafe {
            let _ = sys::unmap(base, len);
        });
        unsafe { sys::protect_none(base, page_size) }.map_err(Error::OutOfMemory)?;
        let base = scopeguard::ScopeGuard::into_inner(mapping);

        log::trace!(
            "mapped guarded region at {:p} ({} bytes, guard {} bytes)",
            base,
            len,
            page_size
        );
        Ok(Self { base, len })
    }

    /// Unmaps the whole region in one operation.
    pub fn release(self) -> Result<()> {
        unsafe { sys::unmap(self.base, self.len) }.map_err(Error::ReleaseFailed)?;
        log::trace!("unmapped guarded region at {:p}", self.base);
        Ok(())
    }

    /// Lowest address of the region, which is also the start of the guard page.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Total length of the mapping, guard page included.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Address range of the guard page.
    pub fn guard_range(&self) -> Range<usize> {
        let base = self.base.as_ptr() as usize;
        base..base + page_size()
    }

    /// Lowest accessible address, directly above the guard page.
    #[inline]
    pub fn usable_low(&self) -> StackPointer {
        // The guard page is never at address zero.
        unsafe { StackPointer::new_unchecked(self.guard_range().end) }
    }

    /// One past the highest address of the region.
    #[inline]
    pub fn top(&self) -> StackPointer {
        unsafe { StackPointer::new_unchecked(self.base.as_ptr() as usize + self.len) }
    }

    /// Number of accessible bytes, i.e. everything but the guard page.
    #[inline]
    pub fn usable_len(&self) -> usize {
        self.len - page_size()
    }
}

#[test]
fn mapping_len_rounds_and_adds_guard() {
    let page = 4096;
    assert_eq!(mapping_len(0, page).unwrap(), 2 * page);
    assert_eq!(mapping_len(1, page).unwrap(), 2 * page);
    assert_eq!(mapping_len(page, page).unwrap(), 2 * page);
    assert_eq!(mapping_len(page + 1, page).unwrap(), 3 * page);
    assert_eq!(mapping_len(8192, page).unwrap(), 3 * page);
    assert_eq!(mapping_len(MAX_STACK_SIZE, page).unwrap(), MAX_STACK_SIZE + page);
    assert!(matches!(
        mapping_len(MAX_STACK_SIZE + 1, page),
        Err(Error::StackTooLarge { requested }) if requested == MAX_STACK_SIZE + 1
    ));
}

#[test]
fn page_size_is_cached() {
    let first = page_size();
    assert!(first.is_power_of_two());
    assert_eq!(PAGE_SIZE.load(Ordering::Relaxed), first);
    assert_eq!(page_size(), first);
}
