//! Producer side of a frag link.
//!
//! [`FragPublisher`] writes frags into an mcache/dcache pair following the
//! seqlock protocol the archive tile reads with. It drives load generators
//! and tests; production producers only need to honour the same protocol.

use crate::tango::mcache::Frag;
use crate::tango::{Dcache, Fseq, Mcache, seq_diff};

/// Errors raised by [`FragPublisher::publish`].
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("payload of {sz} bytes exceeds dcache mtu {mtu}")]
    TooLarge { sz: usize, mtu: usize },
    #[error("chunk {chunk} cannot hold a {sz} byte payload")]
    OutOfBounds { chunk: u32, sz: usize },
}

/// Publishes frags into one mcache/dcache pair.
pub struct FragPublisher<'a> {
    mcache: &'a Mcache,
    dcache: &'a Dcache,
    seq: u64,
    chunk: u32,
}

impl<'a> FragPublisher<'a> {
    /// Starts publishing at the sequence the mcache currently advertises.
    #[must_use]
    pub fn new(mcache: &'a Mcache, dcache: &'a Dcache) -> Self {
        Self {
            mcache,
            dcache,
            seq: mcache.seq_query(),
            chunk: 0,
        }
    }

    /// Sequence number the next frag will get.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Frags that may be published before overrunning a consumer that
    /// reports its position through `fseq`.
    #[must_use]
    pub fn cr_avail(&self, fseq: &Fseq) -> u64 {
        let outstanding = seq_diff(self.seq, fseq.query()).max(0) as u64;
        self.mcache.depth().saturating_sub(outstanding)
    }

    /// Publishes one frag and advertises it on the mcache sync word.
    ///
    /// Returns the sequence number the frag was published at.
    ///
    /// # Errors
    ///
    /// [`PublishError::TooLarge`] if the payload exceeds the dcache MTU and
    /// [`PublishError::OutOfBounds`] if it does not fit at the current
    /// chunk. Nothing is published on error and the slot is left untouched.
    pub fn publish(
        &mut self,
        payload: &[u8],
        sig: u64,
        ctl: u16,
        tsorig: u64,
    ) -> Result<u64, PublishError> {
        let mtu = self.dcache.mtu();
        let sz = payload.len();
        if sz > mtu {
            return Err(PublishError::TooLarge { sz, mtu });
        }

        let out_of_bounds = PublishError::OutOfBounds {
            chunk: self.chunk,
            sz,
        };
        if self.dcache.chunk_range(self.chunk, sz as u32).is_none() {
            return Err(out_of_bounds);
        }

        let seq = self.seq;
        let line = self.mcache.line(seq);
        line.begin(seq);
        self.dcache.write(self.chunk, payload).ok_or(out_of_bounds)?;
        line.commit(&Frag {
            seq,
            sig,
            chunk: self.chunk,
            sz: sz as u32,
            ctl,
            tsorig,
            tspub: tsorig,
        });

        self.seq = seq.wrapping_add(1);
        self.mcache.seq_update(self.seq);
        self.chunk = self.dcache.compact_next(self.chunk, sz);
        Ok(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tango::mcache::{CTL_EOM, CTL_SOM};

    #[test]
    fn publish_fills_slot_payload_and_sync() {
        let mcache = Mcache::new_heap(8, 10).unwrap();
        let dcache = Dcache::new_heap(64, 8, 1).unwrap();
        let mut publisher = FragPublisher::new(&mcache, &dcache);
        assert_eq!(publisher.seq(), 10);

        let seq = publisher
            .publish(b"abc", 7, CTL_SOM | CTL_EOM, 99)
            .unwrap();
        assert_eq!(seq, 10);
        assert_eq!(mcache.seq_query(), 11);

        let frag = mcache.line(10).snapshot();
        assert_eq!(frag.seq, 10);
        assert_eq!(frag.sig, 7);
        assert_eq!(frag.sz, 3);
        assert_eq!(frag.tsorig, 99);

        let mut out = [0u8; 3];
        assert_eq!(dcache.copy_out(frag.chunk, frag.sz, &mut out), Some(3));
        assert_eq!(&out, b"abc");

        // the next frag lands in a later chunk
        publisher.publish(b"def", 8, 0, 100).unwrap();
        assert_eq!(mcache.line(11).snapshot().chunk, frag.chunk + 1);
    }

    #[test]
    fn oversized_payload_publishes_nothing() {
        let mcache = Mcache::new_heap(4, 0).unwrap();
        let dcache = Dcache::new_heap(16, 4, 1).unwrap();
        let mut publisher = FragPublisher::new(&mcache, &dcache);
        assert!(matches!(
            publisher.publish(&[0u8; 17], 0, 0, 0),
            Err(PublishError::TooLarge { sz: 17, mtu: 16 })
        ));
        assert_eq!(publisher.seq(), 0);
        assert_eq!(mcache.seq_query(), 0);
    }

    #[test]
    fn chunk_overflow_leaves_slot_untouched() {
        let mcache = Mcache::new_heap(4, 0).unwrap();
        let dcache = Dcache::new_heap(16, 4, 1).unwrap();
        let mut publisher = FragPublisher::new(&mcache, &dcache);
        let before = mcache.line(0).seq_sig_query();

        publisher.chunk = dcache.chunk_cnt() as u32;
        assert!(matches!(
            publisher.publish(b"abc", 0, 0, 0),
            Err(PublishError::OutOfBounds { sz: 3, .. })
        ));
        assert_eq!(mcache.line(0).seq_sig_query(), before);
        assert_eq!(publisher.seq(), 0);
        assert_eq!(mcache.seq_query(), 0);
    }

    #[test]
    fn credits_track_consumer_position() {
        let mcache = Mcache::new_heap(4, 0).unwrap();
        let dcache = Dcache::new_heap(16, 4, 1).unwrap();
        let fseq = Fseq::new_heap(0).unwrap();
        let mut publisher = FragPublisher::new(&mcache, &dcache);

        assert_eq!(publisher.cr_avail(&fseq), 4);
        for _ in 0..3 {
            publisher.publish(b"x", 0, 0, 0).unwrap();
        }
        assert_eq!(publisher.cr_avail(&fseq), 1);
        publisher.publish(b"x", 0, 0, 0).unwrap();
        assert_eq!(publisher.cr_avail(&fseq), 0);

        fseq.update(2);
        assert_eq!(publisher.cr_avail(&fseq), 2);
    }
}
