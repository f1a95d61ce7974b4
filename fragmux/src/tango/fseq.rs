//! Flow-control return word.
//!
//! A consumer publishes the sequence number of the next frag it will read
//! from a link. The producer compares it with its own position to bound how
//! far ahead it may run (its credits). The diag slots carry per-link counters
//! the consumer accumulates between updates.
//!
//! ```text
//! offset 0     FseqHeader   magic | seq0   (128 B)
//! offset 128   SeqLine      consumer seq   (128 B)
//! offset 256   DiagLine     diag[16]       (128 B)
//! ```

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{DiagLine, JoinError, SeqLine, header};
use crate::ipc::region::{self, Region};
use crate::ipc::{HeapRegion, SharedMemorySafe};

const FSEQ_MAGIC: u64 = 0x4653_4551_5F5F_5631; // "FSEQ__V1" in ASCII

/// Frags published downstream.
pub const DIAG_PUB_CNT: usize = 0;
/// Payload bytes published downstream.
pub const DIAG_PUB_SZ: usize = 1;
/// Overruns detected while polling for a frag.
pub const DIAG_OVRNP_CNT: usize = 2;
/// Overruns detected while reading a frag (torn reads).
pub const DIAG_OVRNR_CNT: usize = 3;
/// Frags dropped because their descriptor addressed memory out of bounds.
pub const DIAG_MALFORMED_CNT: usize = 4;

const SEQ_OFF: usize = 128;
const DIAG_OFF: usize = SEQ_OFF + size_of::<SeqLine>();
const FOOTPRINT: usize = DIAG_OFF + size_of::<DiagLine>();

#[repr(C, align(128))]
struct FseqHeader {
    magic: AtomicU64,
    seq0: AtomicU64,
}

// SAFETY: repr(C), only atomics, all-zero is a valid value.
unsafe impl SharedMemorySafe for FseqHeader {}

/// A joined flow-control return word.
pub struct Fseq {
    hdr: NonNull<FseqHeader>,
    seq: NonNull<SeqLine>,
    diag: NonNull<DiagLine>,
    _region: Box<dyn Region>,
}

// SAFETY: all pointers target the owned region, accessed only through
// atomics.
unsafe impl Send for Fseq {}
unsafe impl Sync for Fseq {}

impl std::fmt::Debug for Fseq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fseq").field("seq", &self.query()).finish()
    }
}

impl Fseq {
    /// Bytes needed for an fseq.
    #[must_use]
    pub const fn footprint() -> usize {
        FOOTPRINT
    }

    /// Formats `region` as an fseq starting at `seq0` with zeroed
    /// diagnostics.
    ///
    /// # Errors
    ///
    /// The region errors of [`join`](Self::join).
    pub fn new(region: impl Region, seq0: u64) -> Result<Self, JoinError> {
        let fseq = Self::from_region(region)?;
        for slot in &fseq.diag_line().diag {
            slot.store(0, Ordering::Relaxed);
        }
        fseq.seq_line().seq.store(seq0, Ordering::Relaxed);
        fseq.hdr().seq0.store(seq0, Ordering::Relaxed);
        fseq.hdr().magic.store(FSEQ_MAGIC, Ordering::Release);
        Ok(fseq)
    }

    /// Formats a fresh heap-backed fseq.
    ///
    /// # Errors
    ///
    /// [`JoinError::Alloc`] if the allocation fails.
    pub fn new_heap(seq0: u64) -> Result<Self, JoinError> {
        let region = HeapRegion::new(FOOTPRINT).ok_or(JoinError::Alloc {
            object: "fseq",
            len: FOOTPRINT,
        })?;
        Self::new(region, seq0)
    }

    /// Joins an fseq previously formatted by [`new`](Self::new).
    ///
    /// # Errors
    ///
    /// Bad magic, misalignment, or a region smaller than the footprint.
    pub fn join(region: impl Region) -> Result<Self, JoinError> {
        let fseq = Self::from_region(region)?;
        let found = fseq.hdr().magic.load(Ordering::Acquire);
        if found != FSEQ_MAGIC {
            return Err(JoinError::BadMagic {
                object: "fseq",
                found,
            });
        }
        Ok(fseq)
    }

    fn from_region(region: impl Region) -> Result<Self, JoinError> {
        let hdr: &FseqHeader = header(&region, "fseq", FOOTPRINT)?;
        let misaligned = || JoinError::Misaligned { object: "fseq" };
        let seq: &SeqLine = region::view(&region, SEQ_OFF).ok_or_else(misaligned)?;
        let diag: &DiagLine = region::view(&region, DIAG_OFF).ok_or_else(misaligned)?;

        Ok(Self {
            hdr: NonNull::from(hdr),
            seq: NonNull::from(seq),
            diag: NonNull::from(diag),
            _region: Box::new(region),
        })
    }

    fn hdr(&self) -> &FseqHeader {
        // SAFETY: points into the owned region for the lifetime of self.
        unsafe { self.hdr.as_ref() }
    }

    fn seq_line(&self) -> &SeqLine {
        // SAFETY: as above.
        unsafe { self.seq.as_ref() }
    }

    fn diag_line(&self) -> &DiagLine {
        // SAFETY: as above.
        unsafe { self.diag.as_ref() }
    }

    /// Sequence number the fseq was formatted with.
    #[must_use]
    pub fn seq0(&self) -> u64 {
        self.hdr().seq0.load(Ordering::Relaxed)
    }

    /// Next sequence number the consumer will read.
    #[inline]
    pub fn query(&self) -> u64 {
        self.seq_line().seq.load(Ordering::Acquire)
    }

    /// Publishes `seq` as the next sequence number the consumer will read.
    #[inline]
    pub fn update(&self, seq: u64) {
        self.seq_line().seq.store(seq, Ordering::Release);
    }

    /// Diagnostic counter `idx` (`DIAG_*`).
    ///
    /// # Panics
    ///
    /// If `idx >= DIAG_CNT`.
    #[inline]
    pub fn diag(&self, idx: usize) -> &AtomicU64 {
        &self.diag_line().diag[idx]
    }
}
