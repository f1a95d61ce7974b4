//! Frag metadata ring.
//!
//! An mcache is a power-of-two ring of [`FragMeta`] slots plus a sync word
//! where the producer advertises its next sequence number. Frag `seq` lives
//! in slot `seq & (depth - 1)`.
//!
//! # Layout
//!
//! ```text
//! offset 0     McacheHeader   magic | depth | seq0        (128 B)
//! offset 128   SeqLine        producer sync seq           (128 B)
//! offset 256   FragMeta[depth]                            (64 B each)
//! ```
//!
//! # Seqlock Protocol
//!
//! Producer, for frag `seq`:
//!
//! 1. store `seq - 1` into the slot (Relaxed), then a Release fence
//!    ([`FragMeta::begin`])
//! 2. write payload and every other field (Relaxed)
//! 3. store `seq` (Release) ([`FragMeta::commit`])
//!
//! Consumer:
//!
//! 1. load `seq` (Acquire); bail unless it is the expected value
//! 2. copy fields and payload
//! 3. Acquire fence, re-load `seq`; a changed value means the copy may be
//!    torn and must be discarded
//!
//! Step 1 of the producer makes any reader that sees a field written in
//! step 2 also see a `seq` other than the one it started with. That only
//! holds while `seq - 1` differs from what the slot held before, so a ring
//! needs at least [`DEPTH_MIN`] slots.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering, fence};

use super::{JoinError, SeqLine, header};
use crate::ipc::region::{self, Region};
use crate::ipc::{HeapRegion, SharedMemorySafe};
use crate::tempo::PowerOfTwo;

const MCACHE_MAGIC: u64 = 0x4D43_4143_4845_5631; // "MCACHEV1" in ASCII

const HEADER_SZ: usize = 128;
const SYNC_OFF: usize = HEADER_SZ;
const RING_OFF: usize = SYNC_OFF + size_of::<SeqLine>();

/// Start of a self-contained message.
pub const CTL_SOM: u16 = 1 << 0;
/// End of a self-contained message.
pub const CTL_EOM: u16 = 1 << 1;
/// Producer flagged the frag as damaged.
pub const CTL_ERR: u16 = 1 << 2;

/// One ring slot. Exactly one cache line.
///
/// Every field is an atomic so concurrent producer stores and consumer loads
/// are well defined; ordering comes from the `seq` protocol described in the
/// module docs.
#[repr(C, align(64))]
pub struct FragMeta {
    seq: AtomicU64,
    sig: AtomicU64,
    tsorig: AtomicU64,
    tspub: AtomicU64,
    chunk: AtomicU32,
    sz: AtomicU32,
    ctl: AtomicU16,
}

const _: () = assert!(size_of::<FragMeta>() == 64);

// SAFETY: repr(C), only atomics, all-zero is a valid value.
unsafe impl SharedMemorySafe for FragMeta {}

/// A plain copy of a slot's fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Frag {
    pub seq: u64,
    pub sig: u64,
    pub chunk: u32,
    pub sz: u32,
    pub ctl: u16,
    pub tsorig: u64,
    pub tspub: u64,
}

impl FragMeta {
    /// Loads `(seq, sig)`, with Acquire on `seq`.
    ///
    /// Fields read after this call are at least as new as `seq`.
    #[inline]
    pub fn seq_sig_query(&self) -> (u64, u64) {
        let seq = self.seq.load(Ordering::Acquire);
        let sig = self.sig.load(Ordering::Relaxed);
        (seq, sig)
    }

    /// Re-loads `seq` after a copy.
    ///
    /// The Acquire fence orders every earlier load before this one, so a
    /// producer store that raced the copy shows up as a changed value.
    #[inline]
    pub fn seq_recheck(&self) -> u64 {
        fence(Ordering::Acquire);
        self.seq.load(Ordering::Relaxed)
    }

    /// Copies every field (Relaxed; pair with [`seq_sig_query`](Self::seq_sig_query)).
    #[inline]
    pub fn snapshot(&self) -> Frag {
        Frag {
            seq: self.seq.load(Ordering::Relaxed),
            sig: self.sig.load(Ordering::Relaxed),
            chunk: self.chunk.load(Ordering::Relaxed),
            sz: self.sz.load(Ordering::Relaxed),
            ctl: self.ctl.load(Ordering::Relaxed),
            tsorig: self.tsorig.load(Ordering::Relaxed),
            tspub: self.tspub.load(Ordering::Relaxed),
        }
    }

    /// Step 1 of the producer protocol: marks the slot as being rewritten
    /// for frag `seq`.
    ///
    /// Payload bytes written after this call are covered by the seq
    /// recheck of any consumer still copying the slot's previous frag.
    #[inline]
    pub fn begin(&self, seq: u64) {
        self.seq.store(seq.wrapping_sub(1), Ordering::Relaxed);
        fence(Ordering::Release);
    }

    /// Steps 2 and 3 of the producer protocol: writes every field, then
    /// releases `frag.seq`.
    #[inline]
    pub fn commit(&self, frag: &Frag) {
        self.sig.store(frag.sig, Ordering::Relaxed);
        self.chunk.store(frag.chunk, Ordering::Relaxed);
        self.sz.store(frag.sz, Ordering::Relaxed);
        self.ctl.store(frag.ctl, Ordering::Relaxed);
        self.tsorig.store(frag.tsorig, Ordering::Relaxed);
        self.tspub.store(frag.tspub, Ordering::Relaxed);
        self.seq.store(frag.seq, Ordering::Release);
    }

    /// [`begin`](Self::begin) followed by [`commit`](Self::commit), for
    /// frags whose payload is already in place.
    #[inline]
    pub fn publish(&self, frag: &Frag) {
        self.begin(frag.seq);
        self.commit(frag);
    }
}

#[repr(C, align(128))]
struct McacheHeader {
    magic: AtomicU64,
    depth: AtomicU64,
    seq0: AtomicU64,
}

const _: () = assert!(size_of::<McacheHeader>() == HEADER_SZ);

// SAFETY: repr(C), only atomics, all-zero is a valid value.
unsafe impl SharedMemorySafe for McacheHeader {}

/// Smallest usable ring depth.
///
/// With one slot, `begin(seq)` stamps the sequence the slot already holds
/// and a reader of that frag cannot see the rewrite.
pub const DEPTH_MIN: u64 = 2;

fn checked_depth(depth: u64) -> Result<PowerOfTwo, JoinError> {
    PowerOfTwo::new(depth)
        .filter(|depth| depth.get() >= DEPTH_MIN)
        .ok_or(JoinError::BadDepth { depth })
}

/// A joined frag metadata ring.
pub struct Mcache {
    hdr: NonNull<McacheHeader>,
    sync: NonNull<SeqLine>,
    ring: NonNull<FragMeta>,
    depth: PowerOfTwo,
    _region: Box<dyn Region>,
}

// SAFETY: all pointers target the owned region, which is shared memory
// accessed only through atomics.
unsafe impl Send for Mcache {}
unsafe impl Sync for Mcache {}

impl std::fmt::Debug for Mcache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mcache")
            .field("depth", &self.depth())
            .field("seq", &self.seq_query())
            .finish()
    }
}

impl Mcache {
    /// Bytes needed for an mcache of `depth` slots, or `None` on overflow.
    #[must_use]
    pub const fn footprint(depth: u64) -> Option<usize> {
        if depth > usize::MAX as u64 {
            return None;
        }
        match (depth as usize).checked_mul(size_of::<FragMeta>()) {
            Some(ring) => ring.checked_add(RING_OFF),
            None => None,
        }
    }

    /// Formats `region` as an empty mcache whose first frag will be `seq0`.
    ///
    /// Every slot is stamped with a sequence before `seq0`, so a consumer
    /// starting at `seq0` sees nothing until the producer publishes.
    ///
    /// # Errors
    ///
    /// [`JoinError::BadDepth`] for a depth that is not a power of two or is
    /// below [`DEPTH_MIN`], and the region errors of [`join`](Self::join).
    pub fn new(region: impl Region, depth: u64, seq0: u64) -> Result<Self, JoinError> {
        let depth_p2 = checked_depth(depth)?;
        let (hdr, sync, ring) = Self::layout(&region, depth_p2)?;

        // SAFETY: pointers were produced by `layout` against this region.
        let (hdr_ref, sync_ref, ring_ref) = unsafe {
            (
                hdr.as_ref(),
                sync.as_ref(),
                std::slice::from_raw_parts(ring.as_ptr(), depth as usize),
            )
        };

        let mask = depth - 1;
        for (idx, line) in ring_ref.iter().enumerate() {
            let stale = seq0
                .wrapping_sub(1)
                .wrapping_sub(seq0.wrapping_sub(1).wrapping_sub(idx as u64) & mask);
            line.publish(&Frag {
                seq: stale,
                ..Frag::default()
            });
        }
        sync_ref.seq.store(seq0, Ordering::Relaxed);
        hdr_ref.depth.store(depth, Ordering::Relaxed);
        hdr_ref.seq0.store(seq0, Ordering::Relaxed);
        hdr_ref.magic.store(MCACHE_MAGIC, Ordering::Release);

        Ok(Self {
            hdr,
            sync,
            ring,
            depth: depth_p2,
            _region: Box::new(region),
        })
    }

    /// Formats a fresh heap-backed mcache.
    ///
    /// # Errors
    ///
    /// As [`new`](Self::new), plus [`JoinError::Alloc`].
    pub fn new_heap(depth: u64, seq0: u64) -> Result<Self, JoinError> {
        checked_depth(depth)?;
        let len = Self::footprint(depth).ok_or(JoinError::BadDepth { depth })?;
        let region = HeapRegion::new(len).ok_or(JoinError::Alloc {
            object: "mcache",
            len,
        })?;
        Self::new(region, depth, seq0)
    }

    /// Joins an mcache previously formatted by [`new`](Self::new).
    ///
    /// # Errors
    ///
    /// Bad magic, misalignment, an unusable depth, or a region smaller than
    /// the footprint its header declares.
    pub fn join(region: impl Region) -> Result<Self, JoinError> {
        let hdr: &McacheHeader = header(&region, "mcache", RING_OFF)?;
        let found = hdr.magic.load(Ordering::Acquire);
        if found != MCACHE_MAGIC {
            return Err(JoinError::BadMagic {
                object: "mcache",
                found,
            });
        }
        let depth = hdr.depth.load(Ordering::Relaxed);
        let depth_p2 = checked_depth(depth)?;
        let (hdr, sync, ring) = Self::layout(&region, depth_p2)?;

        Ok(Self {
            hdr,
            sync,
            ring,
            depth: depth_p2,
            _region: Box::new(region),
        })
    }

    #[allow(clippy::type_complexity)]
    fn layout(
        region: &dyn Region,
        depth: PowerOfTwo,
    ) -> Result<(NonNull<McacheHeader>, NonNull<SeqLine>, NonNull<FragMeta>), JoinError> {
        let need = Self::footprint(depth.get()).ok_or(JoinError::BadDepth {
            depth: depth.get(),
        })?;
        if region.len() < need {
            return Err(JoinError::TooSmall {
                object: "mcache",
                need,
                have: region.len(),
            });
        }
        let hdr: &McacheHeader = header(region, "mcache", RING_OFF)?;
        let sync: &SeqLine = region::view(region, SYNC_OFF).ok_or(JoinError::Misaligned {
            object: "mcache",
        })?;
        let ring: &[FragMeta] = region::view_slice(region, RING_OFF, depth.get() as usize)
            .ok_or(JoinError::Misaligned { object: "mcache" })?;

        Ok((
            NonNull::from(hdr),
            NonNull::from(sync),
            NonNull::from(&ring[0]),
        ))
    }

    /// Number of slots, a power of two.
    #[inline]
    #[must_use]
    pub fn depth(&self) -> u64 {
        self.depth.get()
    }

    /// Sequence number the ring was formatted to start at.
    #[must_use]
    pub fn seq0(&self) -> u64 {
        // SAFETY: points into the owned region for the lifetime of self.
        unsafe { self.hdr.as_ref() }.seq0.load(Ordering::Relaxed)
    }

    /// Next sequence number the producer advertises.
    #[inline]
    pub fn seq_query(&self) -> u64 {
        // SAFETY: points into the owned region for the lifetime of self.
        unsafe { self.sync.as_ref() }.seq.load(Ordering::Acquire)
    }

    /// Advertises `seq` as the next sequence number.
    #[inline]
    pub fn seq_update(&self, seq: u64) {
        // SAFETY: points into the owned region for the lifetime of self.
        unsafe { self.sync.as_ref() }.seq.store(seq, Ordering::Release);
    }

    /// Slot index for `seq`.
    #[inline]
    #[must_use]
    pub fn line_idx(&self, seq: u64) -> usize {
        (seq & (self.depth.get() - 1)) as usize
    }

    /// All slots, in index order.
    #[inline]
    pub fn ring(&self) -> &[FragMeta] {
        // SAFETY: `layout` validated `depth` slots at this address; the
        // region lives as long as self.
        unsafe { std::slice::from_raw_parts(self.ring.as_ptr(), self.depth.get() as usize) }
    }

    /// Slot that frag `seq` lives in.
    #[inline]
    pub fn line(&self, seq: u64) -> &FragMeta {
        &self.ring()[self.line_idx(seq)]
    }

    /// Publishes `frag` into its slot. Does not touch the sync word.
    #[inline]
    pub fn publish(&self, frag: &Frag) {
        self.line(frag.seq).publish(frag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tango::{seq_diff, seq_lt};
    use std::sync::Arc;

    #[test]
    fn footprint_covers_header_and_ring() {
        assert_eq!(Mcache::footprint(8), Some(256 + 8 * 64));
        assert_eq!(Mcache::footprint(u64::MAX), None);
    }

    #[test]
    fn new_stamps_every_slot_behind_seq0() {
        for seq0 in [0u64, 5, 1 << 40, u64::MAX - 2] {
            let mcache = Mcache::new_heap(8, seq0).unwrap();
            assert_eq!(mcache.seq_query(), seq0);
            assert_eq!(mcache.seq0(), seq0);
            for (idx, line) in mcache.ring().iter().enumerate() {
                let (seq, _) = line.seq_sig_query();
                assert_eq!(mcache.line_idx(seq), idx);
                assert!(seq_lt(seq, seq0));
                assert!(seq_diff(seq0, seq) <= 8);
            }
        }
    }

    #[test]
    fn publish_then_query() {
        let mcache = Mcache::new_heap(4, 0).unwrap();
        let frag = Frag {
            seq: 6,
            sig: 0xfeed,
            chunk: 3,
            sz: 42,
            ctl: CTL_SOM | CTL_EOM,
            tsorig: 1000,
            tspub: 1001,
        };
        mcache.publish(&frag);

        let line = mcache.line(6);
        assert_eq!(line.seq_sig_query(), (6, 0xfeed));
        assert_eq!(line.snapshot(), frag);
        assert_eq!(line.seq_recheck(), 6);
        assert!(std::ptr::eq(line, &mcache.ring()[2]));
    }

    #[test]
    fn join_sees_formatted_ring() {
        let len = Mcache::footprint(16).unwrap();
        let region = Arc::new(HeapRegion::new(len).unwrap());

        let created = Mcache::new(region.clone(), 16, 100).unwrap();
        let joined = Mcache::join(region).unwrap();
        assert_eq!(joined.depth(), 16);
        assert_eq!(joined.seq_query(), 100);

        created.seq_update(105);
        assert_eq!(joined.seq_query(), 105);
    }

    #[test]
    fn join_rejects_garbage() {
        let region = HeapRegion::new(Mcache::footprint(8).unwrap()).unwrap();
        assert!(matches!(
            Mcache::join(region),
            Err(JoinError::BadMagic { object: "mcache", found: 0 })
        ));
    }

    #[test]
    fn single_slot_ring_is_rejected() {
        assert!(matches!(
            Mcache::new_heap(1, 0),
            Err(JoinError::BadDepth { depth: 1 })
        ));
        assert!(Mcache::new_heap(DEPTH_MIN, 0).is_ok());

        // a header claiming depth 1 does not join either
        let len = Mcache::footprint(2).unwrap();
        let region = Arc::new(HeapRegion::new(len).unwrap());
        let created = Mcache::new(region.clone(), 2, 0).unwrap();
        // SAFETY: the header lives in `region`, which is still mapped.
        unsafe { created.hdr.as_ref() }
            .depth
            .store(1, Ordering::Relaxed);
        assert!(matches!(
            Mcache::join(region),
            Err(JoinError::BadDepth { depth: 1 })
        ));
    }

    #[test]
    fn new_rejects_bad_depth_and_small_region() {
        assert!(matches!(
            Mcache::new_heap(6, 0),
            Err(JoinError::BadDepth { depth: 6 })
        ));
        assert!(matches!(
            Mcache::new_heap(0, 0),
            Err(JoinError::BadDepth { depth: 0 })
        ));

        let region = HeapRegion::new(Mcache::footprint(8).unwrap()).unwrap();
        assert!(matches!(
            Mcache::new(region, 16, 0),
            Err(JoinError::TooSmall { object: "mcache", .. })
        ));
    }
}
