//! Byte regions that tango objects are laid out in.
//!
//! A [`Region`] is a fixed block of writable memory. Shared memory mappings
//! ([`ShmRegion`](super::shmem::ShmRegion)) are the production backing;
//! [`HeapRegion`] is the same thing for a single process, used when producer
//! and tile live in one address space and by tests.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::Arc;

use super::shmem::SharedMemorySafe;

/// Alignment every region base satisfies.
pub const REGION_ALIGN: usize = 128;

/// A fixed block of writable memory that outlives every view into it.
///
/// # Safety
///
/// Implementers must guarantee that `base()` points to `len()` bytes that
/// stay mapped, writable, and at the same address for the lifetime of the
/// value, and that `base()` is aligned to at least [`REGION_ALIGN`].
pub unsafe trait Region: Send + Sync + 'static {
    /// Start of the region.
    fn base(&self) -> NonNull<u8>;

    /// Length of the region in bytes.
    fn len(&self) -> usize;
}

// SAFETY: the inner region is kept alive by the Arc and never moves.
unsafe impl<R: Region> Region for Arc<R> {
    fn base(&self) -> NonNull<u8> {
        (**self).base()
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

/// Returns a shared view of a `T` at `offset` bytes into `region`.
///
/// Returns `None` if the view would be misaligned or run past the end.
pub fn view<T: SharedMemorySafe>(region: &dyn Region, offset: usize) -> Option<&T> {
    view_slice(region, offset, 1).map(|slice| &slice[0])
}

/// Returns a shared view of `cnt` consecutive `T`s at `offset` bytes into
/// `region`.
pub fn view_slice<T: SharedMemorySafe>(
    region: &dyn Region,
    offset: usize,
    cnt: usize,
) -> Option<&[T]> {
    let bytes = size_of::<T>().checked_mul(cnt)?;
    let end = offset.checked_add(bytes)?;
    if end > region.len() {
        return None;
    }

    // SAFETY: offset is in bounds per the check above.
    let ptr = unsafe { region.base().as_ptr().add(offset) };
    if ptr.align_offset(align_of::<T>()) != 0 {
        return None;
    }

    // SAFETY: in bounds and aligned. `T: SharedMemorySafe` makes any bit
    // pattern a peer may have written (including all zeroes) valid, and all
    // shared mutation goes through atomics.
    Some(unsafe { std::slice::from_raw_parts(ptr.cast::<T>(), cnt) })
}

/// A zero-filled, [`REGION_ALIGN`]-aligned heap allocation.
pub struct HeapRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the allocation is uniquely owned; concurrent access goes through
// atomic views only.
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    /// Allocates `len` zeroed bytes.
    ///
    /// Returns `None` for a zero length, a length that overflows the layout
    /// rules, or if the allocator fails.
    #[must_use]
    pub fn new(len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        let layout = Layout::from_size_align(len, REGION_ALIGN).ok()?;
        // SAFETY: layout has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        Some(Self { ptr, layout })
    }
}

// SAFETY: the allocation lives until drop and is aligned to REGION_ALIGN.
unsafe impl Region for HeapRegion {
    fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn heap_region_is_zeroed_and_aligned() {
        let region = HeapRegion::new(1024).unwrap();
        assert_eq!(region.len(), 1024);
        assert_eq!(region.base().as_ptr() as usize % REGION_ALIGN, 0);

        let words: &[AtomicU64] = view_slice(&region, 0, 128).unwrap();
        assert!(words.iter().all(|w| w.load(Ordering::Relaxed) == 0));
    }

    #[test]
    fn zero_length_is_rejected() {
        assert!(HeapRegion::new(0).is_none());
    }

    #[test]
    fn views_are_bounds_checked() {
        let region = HeapRegion::new(256).unwrap();
        assert!(view::<AtomicU64>(&region, 248).is_some());
        assert!(view::<AtomicU64>(&region, 249).is_none());
        assert!(view::<AtomicU64>(&region, 256).is_none());
        assert!(view_slice::<AtomicU64>(&region, 0, 33).is_none());
        assert!(view_slice::<AtomicU64>(&region, 0, usize::MAX).is_none());
    }

    #[test]
    fn views_are_alignment_checked() {
        let region = HeapRegion::new(256).unwrap();
        assert!(view::<AtomicU64>(&region, 4).is_none());
        assert!(view::<u8>(&region, 3).is_some());
    }

    #[test]
    fn views_share_the_same_bytes() {
        let region = HeapRegion::new(128).unwrap();
        let a: &AtomicU64 = view(&region, 64).unwrap();
        let b: &AtomicU64 = view(&region, 64).unwrap();
        a.store(7, Ordering::Relaxed);
        assert_eq!(b.load(Ordering::Relaxed), 7);
    }
}
