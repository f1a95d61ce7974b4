//! Per-input read state.
//!
//! Each input link is tracked by an [`InputDescriptor`] sized to one cache
//! line: where the next frag should appear, which slot to watch for it, and
//! where to return flow-control credits. Polling an input is one seqlock
//! attempt against that slot.

use crate::tango::mcache::Frag;
use crate::tango::{Dcache, FragMeta, Fseq, Mcache, seq_diff};

use super::TileError;

/// Maximum number of inputs a tile can drain.
pub const IN_MAX: usize = 256;

/// One upstream link: a producer's frag ring, its payload store, and the
/// flow-control word the tile reports its progress on.
#[derive(Debug, Clone, Copy)]
pub struct InputLink<'a> {
    pub mcache: &'a Mcache,
    pub dcache: &'a Dcache,
    pub fseq: &'a Fseq,
}

/// Read state of one input.
///
/// Invariants:
/// - `mline` is the slot of `seq` in `ring`
/// - `seq` only moves forward
#[repr(C, align(64))]
pub(crate) struct InputDescriptor<'a> {
    ring: &'a [FragMeta],
    dcache: &'a Dcache,
    fseq: &'a Fseq,
    mline: &'a FragMeta,
    seq: u64,
    depth: u32,
    idx: u32,
}

const _: () = assert!(size_of::<InputDescriptor<'static>>() == 64);

/// Outcome of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Poll {
    /// No new frag.
    Idle,
    /// The producer lapped the expected frag before it was read. The input
    /// resumed `skipped` frags further on.
    Overrun { skipped: u64 },
    /// The slot changed during the copy. The input resumed `skipped` frags
    /// further on.
    Torn { skipped: u64 },
    /// The frag addressed payload outside its dcache or larger than the
    /// scratch buffer. It was skipped.
    Malformed { chunk: u32, sz: u32 },
    /// A frag was copied into the front of the scratch buffer.
    Frag(Frag),
}

/// Builds descriptors for `links`, each starting at its producer's current
/// sequence number.
///
/// Returns the descriptors and the depth of the shallowest input.
pub(crate) fn register<'a>(
    links: &[InputLink<'a>],
) -> Result<(Vec<InputDescriptor<'a>>, Option<u64>), TileError> {
    if links.len() > IN_MAX {
        return Err(TileError::TooManyInputs {
            cnt: links.len(),
            max: IN_MAX,
        });
    }

    let mut min_depth = None;
    let inputs = links
        .iter()
        .enumerate()
        .map(|(idx, link)| {
            let depth = link.mcache.depth();
            let depth32 =
                u32::try_from(depth).map_err(|_| TileError::InputTooDeep { idx, depth })?;
            min_depth = Some(min_depth.map_or(depth, |min: u64| min.min(depth)));

            let ring = link.mcache.ring();
            let seq = link.mcache.seq_query();
            Ok(InputDescriptor {
                ring,
                dcache: link.dcache,
                fseq: link.fseq,
                mline: &ring[(seq & (depth - 1)) as usize],
                seq,
                depth: depth32,
                idx: idx as u32,
            })
        })
        .collect::<Result<Vec<_>, TileError>>()?;

    Ok((inputs, min_depth))
}

impl<'a> InputDescriptor<'a> {
    /// Position of this input in the link list handed to the tile.
    #[inline]
    pub(crate) fn idx(&self) -> usize {
        self.idx as usize
    }

    /// Sequence number of the next frag to read.
    #[inline]
    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    #[inline]
    pub(crate) fn fseq(&self) -> &'a Fseq {
        self.fseq
    }

    #[inline]
    fn resync(&mut self, seq: u64) {
        self.seq = seq;
        self.mline = &self.ring[(seq & (self.depth as u64 - 1)) as usize];
    }

    #[inline]
    fn advance(&mut self) {
        self.resync(self.seq.wrapping_add(1));
    }

    /// Makes one attempt at the next frag, copying its payload into
    /// `scratch`.
    #[inline]
    pub(crate) fn poll(&mut self, scratch: &mut [u8]) -> Poll {
        self.poll_with(scratch, || {})
    }

    /// [`poll`](Self::poll) with a hook that runs between the payload copy
    /// and the seq recheck.
    #[inline]
    fn poll_with(&mut self, scratch: &mut [u8], mid_copy: impl FnOnce()) -> Poll {
        let expected = self.seq;
        let (seq_found, _sig) = self.mline.seq_sig_query();

        let diff = seq_diff(expected, seq_found);
        if diff != 0 {
            if diff < 0 {
                self.resync(seq_found);
                return Poll::Overrun {
                    skipped: diff.unsigned_abs(),
                };
            }
            // Slot still holds an older frag: caught up.
            return Poll::Idle;
        }

        let frag = self.mline.snapshot();
        let copied = self.dcache.copy_out(frag.chunk, frag.sz, scratch);
        mid_copy();

        let seq_test = self.mline.seq_recheck();
        if seq_test != seq_found {
            self.resync(seq_test);
            return Poll::Torn {
                skipped: seq_test.wrapping_sub(seq_found),
            };
        }

        self.advance();
        match copied {
            Some(_) => Poll::Frag(Frag {
                seq: seq_found,
                ..frag
            }),
            None => Poll::Malformed {
                chunk: frag.chunk,
                sz: frag.sz,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::FragPublisher;
    use crate::tango::mcache::DEPTH_MIN;

    struct Link {
        mcache: Mcache,
        dcache: Dcache,
        fseq: Fseq,
    }

    impl Link {
        fn new(depth: u64, mtu: usize, seq0: u64) -> Self {
            Self {
                mcache: Mcache::new_heap(depth, seq0).unwrap(),
                dcache: Dcache::new_heap(mtu, depth, 1).unwrap(),
                fseq: Fseq::new_heap(seq0).unwrap(),
            }
        }

        fn as_input(&self) -> InputLink<'_> {
            InputLink {
                mcache: &self.mcache,
                dcache: &self.dcache,
                fseq: &self.fseq,
            }
        }
    }

    fn single(link: &Link) -> InputDescriptor<'_> {
        let (mut inputs, _) = register(&[link.as_input()]).unwrap();
        inputs.pop().unwrap()
    }

    #[test]
    fn register_starts_at_producer_sync() {
        let a = Link::new(8, 64, 100);
        let b = Link::new(4, 64, 7);
        let (inputs, min_depth) = register(&[a.as_input(), b.as_input()]).unwrap();
        assert_eq!(min_depth, Some(4));
        assert_eq!(inputs[0].seq(), 100);
        assert_eq!(inputs[1].seq(), 7);
        assert_eq!(inputs[1].idx(), 1);
        assert!(std::ptr::eq(inputs[0].mline, a.mcache.line(100)));

        let (inputs, min_depth) = register(&[]).unwrap();
        assert!(inputs.is_empty());
        assert_eq!(min_depth, None);
    }

    #[test]
    fn register_rejects_too_many_inputs() {
        let link = Link::new(4, 64, 0);
        let links = vec![link.as_input(); IN_MAX + 1];
        assert!(matches!(
            register(&links),
            Err(TileError::TooManyInputs { cnt: 257, max: 256 })
        ));
        assert!(register(&links[..IN_MAX]).is_ok());
    }

    #[test]
    fn poll_reads_frags_in_order_then_idles() {
        let link = Link::new(8, 64, 0);
        let mut input = single(&link);
        let mut publisher = FragPublisher::new(&link.mcache, &link.dcache);
        let mut scratch = vec![0u8; 64];

        assert_eq!(input.poll(&mut scratch), Poll::Idle);

        publisher.publish(b"first", 1, 0, 10).unwrap();
        publisher.publish(b"second", 2, 0, 20).unwrap();

        let Poll::Frag(frag) = input.poll(&mut scratch) else {
            panic!("expected a frag");
        };
        assert_eq!((frag.seq, frag.sig, frag.tsorig), (0, 1, 10));
        assert_eq!(&scratch[..frag.sz as usize], b"first");

        let Poll::Frag(frag) = input.poll(&mut scratch) else {
            panic!("expected a frag");
        };
        assert_eq!(frag.seq, 1);
        assert_eq!(&scratch[..frag.sz as usize], b"second");

        assert_eq!(input.poll(&mut scratch), Poll::Idle);
        assert_eq!(input.seq(), 2);
    }

    #[test]
    fn poll_detects_overrun_and_resyncs() {
        let link = Link::new(4, 64, 0);
        let mut input = single(&link);
        let mut publisher = FragPublisher::new(&link.mcache, &link.dcache);
        let mut scratch = vec![0u8; 64];

        for seq in 0..10u64 {
            publisher.publish(&[seq as u8; 8], seq, 0, seq).unwrap();
        }

        // slot of seq 0 now holds seq 8
        assert_eq!(input.poll(&mut scratch), Poll::Overrun { skipped: 8 });
        assert_eq!(input.seq(), 8);

        let Poll::Frag(frag) = input.poll(&mut scratch) else {
            panic!("expected a frag");
        };
        assert_eq!(frag.seq, 8);
        assert_eq!(&scratch[..8], &[8u8; 8]);
    }

    #[test]
    fn poll_discards_torn_copy() {
        let link = Link::new(4, 64, 0);
        let mut input = single(&link);
        let mut publisher = FragPublisher::new(&link.mcache, &link.dcache);
        let mut scratch = vec![0u8; 64];

        publisher.publish(&[0xaa; 16], 0, 0, 0).unwrap();

        // the producer laps the slot while the payload is being copied
        let polled = input.poll_with(&mut scratch, || {
            for seq in 1..=4u64 {
                publisher.publish(&[0xbb; 16], seq, 0, seq).unwrap();
            }
        });
        assert_eq!(polled, Poll::Torn { skipped: 4 });
        assert_eq!(input.seq(), 4);

        let Poll::Frag(frag) = input.poll(&mut scratch) else {
            panic!("expected a frag");
        };
        assert_eq!(frag.seq, 4);
        assert_eq!(&scratch[..16], &[0xbb; 16]);
    }

    #[test]
    fn poll_sees_rewrite_on_shallowest_ring() {
        let link = Link::new(DEPTH_MIN, 64, 0);
        let mut input = single(&link);
        let mut publisher = FragPublisher::new(&link.mcache, &link.dcache);
        let mut scratch = vec![0u8; 64];

        publisher.publish(&[0xaa; 16], 0, 0, 0).unwrap();
        publisher.publish(&[0xcc; 16], 1, 0, 1).unwrap();

        // frag 2 starts in the slot and chunk of frag 0 mid-copy
        let polled = input.poll_with(&mut scratch, || {
            link.mcache.line(2).begin(2);
            link.dcache.write(0, &[0xbb; 16]).unwrap();
        });
        assert_eq!(polled, Poll::Torn { skipped: 1 });
        assert_eq!(input.seq(), 1);

        let Poll::Frag(frag) = input.poll(&mut scratch) else {
            panic!("expected a frag");
        };
        assert_eq!(frag.seq, 1);
        assert_eq!(&scratch[..16], &[0xcc; 16]);
    }

    #[test]
    fn poll_skips_frag_larger_than_scratch() {
        let link = Link::new(4, 64, 0);
        let mut input = single(&link);
        let mut publisher = FragPublisher::new(&link.mcache, &link.dcache);
        let mut scratch = vec![0u8; 16];

        publisher.publish(&[1u8; 40], 0, 0, 0).unwrap();
        publisher.publish(&[2u8; 8], 1, 0, 0).unwrap();

        assert_eq!(input.poll(&mut scratch), Poll::Malformed { chunk: 0, sz: 40 });
        assert_eq!(scratch, vec![0u8; 16]);

        let Poll::Frag(frag) = input.poll(&mut scratch) else {
            panic!("expected a frag");
        };
        assert_eq!(frag.seq, 1);
    }

    #[test]
    fn poll_skips_frag_outside_dcache() {
        let link = Link::new(4, 64, 0);
        let mut input = single(&link);
        let mut scratch = vec![0u8; 64];

        // hand-built descriptor pointing past the payload area
        let chunk = link.dcache.chunk_cnt() as u32;
        link.mcache.publish(&Frag {
            seq: 0,
            chunk,
            sz: 1,
            ..Frag::default()
        });
        link.mcache.seq_update(1);

        assert_eq!(input.poll(&mut scratch), Poll::Malformed { chunk, sz: 1 });
        assert_eq!(input.seq(), 1);
    }
}
