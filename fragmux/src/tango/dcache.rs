//! Payload store.
//!
//! A dcache is a flat byte area that producers carve into frags. Frags are
//! addressed by chunk index: a frag at `chunk` starts `chunk * CHUNK_ALIGN`
//! bytes into the data area. Producers allocate chunks with
//! [`Dcache::compact_next`], which packs frags back to back and wraps to
//! chunk 0 once an MTU-sized frag would no longer fit.
//!
//! A payload is only reused once the producer has moved far enough ahead
//! that its mcache slot has been overwritten too. Sizing the data area with
//! [`Dcache::req_data_sz`] guarantees this, so the consumer's mcache seq
//! recheck is enough to detect a payload overwritten mid copy.

use std::ops::Range;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{JoinError, header};
use crate::ipc::{HeapRegion, Region, SharedMemorySafe};

/// Chunk size in bytes; every frag starts on a chunk boundary.
pub const CHUNK_ALIGN: usize = 128;

const DCACHE_MAGIC: u64 = 0x4443_4143_4845_5631; // "DCACHEV1" in ASCII

const HEADER_SZ: usize = 128;

#[repr(C, align(128))]
struct DcacheHeader {
    magic: AtomicU64,
    data_sz: AtomicU64,
    mtu: AtomicU64,
}

const _: () = assert!(size_of::<DcacheHeader>() == HEADER_SZ);

// SAFETY: repr(C), only atomics, all-zero is a valid value.
unsafe impl SharedMemorySafe for DcacheHeader {}

const fn align_up(val: usize, align: usize) -> Option<usize> {
    match val.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// A joined payload store.
pub struct Dcache {
    data: NonNull<u8>,
    data_sz: usize,
    mtu: usize,
    _region: Box<dyn Region>,
}

// SAFETY: `data` targets the owned region. Concurrent byte access is
// arbitrated by the mcache seq protocol.
unsafe impl Send for Dcache {}
unsafe impl Sync for Dcache {}

impl std::fmt::Debug for Dcache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dcache")
            .field("data_sz", &self.data_sz)
            .field("mtu", &self.mtu)
            .finish()
    }
}

impl Dcache {
    /// Bytes needed for a dcache with `data_sz` bytes of payload area.
    #[must_use]
    pub const fn footprint(data_sz: usize) -> Option<usize> {
        match align_up(data_sz, CHUNK_ALIGN) {
            Some(data) => data.checked_add(HEADER_SZ),
            None => None,
        }
    }

    /// Payload bytes needed so a producer publishing frags of up to `mtu`
    /// bytes into a `depth` slot mcache, with up to `burst` frags written
    /// ahead of publication, never reuses a payload whose slot is still
    /// live.
    #[must_use]
    pub fn req_data_sz(mtu: usize, depth: u64, burst: u64) -> Option<usize> {
        if mtu == 0 || depth == 0 {
            return None;
        }
        let slot = align_up(mtu, CHUNK_ALIGN)?;
        let cnt = usize::try_from(depth.checked_add(burst)?).ok()?;
        slot.checked_mul(cnt)
    }

    /// Formats `region` as a dcache for frags of up to `mtu` bytes.
    ///
    /// # Errors
    ///
    /// [`JoinError::BadGeometry`] if `mtu` is zero or larger than
    /// `data_sz`, and the region errors of [`join`](Self::join).
    pub fn new(region: impl Region, mtu: usize, data_sz: usize) -> Result<Self, JoinError> {
        if mtu == 0 || data_sz < mtu {
            return Err(JoinError::BadGeometry {
                object: "dcache",
                reason: "mtu must be in [1, data_sz]",
            });
        }
        let need = Self::footprint(data_sz).ok_or(JoinError::BadGeometry {
            object: "dcache",
            reason: "data_sz overflows",
        })?;
        let hdr: &DcacheHeader = header(&region, "dcache", need)?;
        hdr.data_sz.store(data_sz as u64, Ordering::Relaxed);
        hdr.mtu.store(mtu as u64, Ordering::Relaxed);
        hdr.magic.store(DCACHE_MAGIC, Ordering::Release);

        Ok(Self::from_parts(region, data_sz, mtu))
    }

    /// Formats a heap-backed dcache sized by [`req_data_sz`](Self::req_data_sz).
    ///
    /// # Errors
    ///
    /// As [`new`](Self::new), plus [`JoinError::Alloc`].
    pub fn new_heap(mtu: usize, depth: u64, burst: u64) -> Result<Self, JoinError> {
        let geometry = JoinError::BadGeometry {
            object: "dcache",
            reason: "mtu, depth and burst give no usable size",
        };
        let data_sz = Self::req_data_sz(mtu, depth, burst).ok_or(geometry)?;
        let len = Self::footprint(data_sz).ok_or(JoinError::BadGeometry {
            object: "dcache",
            reason: "data_sz overflows",
        })?;
        let region = HeapRegion::new(len).ok_or(JoinError::Alloc {
            object: "dcache",
            len,
        })?;
        Self::new(region, mtu, data_sz)
    }

    /// Joins a dcache previously formatted by [`new`](Self::new).
    ///
    /// # Errors
    ///
    /// Bad magic, misalignment, inconsistent geometry, or a region smaller
    /// than the footprint its header declares.
    pub fn join(region: impl Region) -> Result<Self, JoinError> {
        let hdr: &DcacheHeader = header(&region, "dcache", HEADER_SZ)?;
        let found = hdr.magic.load(Ordering::Acquire);
        if found != DCACHE_MAGIC {
            return Err(JoinError::BadMagic {
                object: "dcache",
                found,
            });
        }
        let geometry = JoinError::BadGeometry {
            object: "dcache",
            reason: "header sizes are inconsistent",
        };
        let data_sz = usize::try_from(hdr.data_sz.load(Ordering::Relaxed)).map_err(|_| geometry)?;
        let mtu = usize::try_from(hdr.mtu.load(Ordering::Relaxed)).unwrap_or(usize::MAX);
        if mtu == 0 || mtu > data_sz {
            return Err(JoinError::BadGeometry {
                object: "dcache",
                reason: "header sizes are inconsistent",
            });
        }
        match Self::footprint(data_sz) {
            Some(need) if need <= region.len() => {}
            need => {
                return Err(JoinError::TooSmall {
                    object: "dcache",
                    need: need.unwrap_or(usize::MAX),
                    have: region.len(),
                });
            }
        }

        Ok(Self::from_parts(region, data_sz, mtu))
    }

    fn from_parts(region: impl Region, data_sz: usize, mtu: usize) -> Self {
        // SAFETY: callers checked the region holds HEADER_SZ + data_sz bytes.
        let data = unsafe { region.base().add(HEADER_SZ) };
        Self {
            data,
            data_sz,
            mtu,
            _region: Box::new(region),
        }
    }

    /// Size of the payload area in bytes.
    #[inline]
    #[must_use]
    pub fn data_sz(&self) -> usize {
        self.data_sz
    }

    /// Largest frag the producer may write.
    #[inline]
    #[must_use]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Number of addressable chunks.
    #[must_use]
    pub fn chunk_cnt(&self) -> usize {
        self.data_sz / CHUNK_ALIGN
    }

    /// Byte range of a `sz` byte frag at `chunk`, or `None` if any of it
    /// falls outside the payload area.
    #[inline]
    #[must_use]
    pub fn chunk_range(&self, chunk: u32, sz: u32) -> Option<Range<usize>> {
        let start = (chunk as usize).checked_mul(CHUNK_ALIGN)?;
        let end = start.checked_add(sz as usize)?;
        (end <= self.data_sz).then_some(start..end)
    }

    /// Copies the frag at `chunk` into the front of `dst`.
    ///
    /// Returns the number of bytes copied, or `None` (copying nothing) if
    /// the frag is out of bounds or does not fit in `dst`.
    ///
    /// A producer may be rewriting the bytes while they are copied; callers
    /// must validate the copy with the frag's mcache seq afterwards.
    #[inline]
    #[must_use]
    pub fn copy_out(&self, chunk: u32, sz: u32, dst: &mut [u8]) -> Option<usize> {
        let range = self.chunk_range(chunk, sz)?;
        let len = range.len();
        let dst = dst.get_mut(..len)?;
        // SAFETY: `range` lies inside the payload area and `dst` is a
        // distinct private buffer of `len` bytes. Bytes raced by a producer
        // may be torn; the caller's seq recheck rejects such copies.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.data.as_ptr().add(range.start),
                dst.as_mut_ptr(),
                len,
            );
        }
        Some(len)
    }

    /// Writes `payload` at `chunk`. Producer side.
    ///
    /// Returns `None` (writing nothing) if the payload is larger than the
    /// MTU or would run past the payload area.
    pub fn write(&self, chunk: u32, payload: &[u8]) -> Option<()> {
        if payload.len() > self.mtu {
            return None;
        }
        let range = self.chunk_range(chunk, u32::try_from(payload.len()).ok()?)?;
        // SAFETY: `range` lies inside the payload area. Consumers reading
        // these bytes concurrently detect the overlap through the mcache.
        unsafe {
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                self.data.as_ptr().add(range.start),
                payload.len(),
            );
        }
        Some(())
    }

    /// Chunk to use after writing a `sz` byte frag at `chunk`.
    ///
    /// Frags are packed back to back; when an MTU-sized frag would no longer
    /// fit after `chunk`, allocation wraps to chunk 0.
    #[must_use]
    pub fn compact_next(&self, chunk: u32, sz: usize) -> u32 {
        let used = sz.div_ceil(CHUNK_ALIGN).max(1);
        let next = chunk as usize + used;
        match next
            .checked_mul(CHUNK_ALIGN)
            .and_then(|start| start.checked_add(self.mtu))
        {
            Some(end) if end <= self.data_sz => next as u32,
            _ => 0,
        }
    }
}
