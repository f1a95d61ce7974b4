//! Low-frequency background work of the archive tile.
//!
//! Housekeeping runs from inside the poll loop whenever its deadline has
//! passed. Each run publishes the output position, heartbeats the cnc and
//! services its signal, then returns credits for one input. The input is
//! picked by an event cursor that sweeps all inputs; when the cursor wraps,
//! a random input is swapped to the front of the poll order so that frags
//! from different inputs do not settle into a fixed interleaving downstream.
//!
//! Deadlines are jittered: every reload picks a delay uniform in
//! `[async_min, 2 * async_min)`.

use std::sync::atomic::Ordering;

use rand::Rng;

use crate::pcapng::CaptureSink;
use crate::tango::CncSignal;
use crate::tango::fseq::{
    DIAG_MALFORMED_CNT, DIAG_OVRNP_CNT, DIAG_OVRNR_CNT, DIAG_PUB_CNT, DIAG_PUB_SZ,
};
use crate::tango::{Cnc, Fseq};
use crate::tempo::{self, PowerOfTwo};
use crate::trace::{debug, trace, warn};

use super::{ArchiveTile, Step, TileStats};

/// Cnc diag slot: frags written to the capture.
pub const CNC_DIAG_FRAG_CNT: usize = 0;
/// Cnc diag slot: payload bytes written to the capture.
pub const CNC_DIAG_FRAG_SZ: usize = 1;
/// Cnc diag slot: overruns detected while polling.
pub const CNC_DIAG_OVRNP_CNT: usize = 2;
/// Cnc diag slot: overruns detected while reading (torn reads).
pub const CNC_DIAG_OVRNR_CNT: usize = 3;
/// Cnc diag slot: frags skipped for payload the tile cannot copy.
pub const CNC_DIAG_MALFORMED_CNT: usize = 4;
/// Cnc diag slot: frags dropped for an unrepresentable timestamp.
pub const CNC_DIAG_TS_DROP_CNT: usize = 5;
/// Cnc diag slot: capture appends that failed.
pub const CNC_DIAG_SINK_ERR_CNT: usize = 6;
/// Cnc diag slot: housekeeping runs.
pub const CNC_DIAG_HOUSEKEEPING_CNT: usize = 7;

/// Housekeeping schedule.
pub(crate) struct Housekeeping {
    event_cnt: usize,
    event_seq: usize,
    async_min: PowerOfTwo,
    then: i64,
}

impl Housekeeping {
    /// A schedule whose first event is due at `now`.
    pub(crate) fn new(event_cnt: usize, async_min: PowerOfTwo, now: i64) -> Self {
        Self {
            event_cnt: event_cnt.max(1),
            event_seq: 0,
            async_min,
            then: now,
        }
    }

    #[inline]
    pub(crate) fn due(&self, now: i64) -> bool {
        now.wrapping_sub(self.then) >= 0
    }

    /// Makes the next event due immediately.
    pub(crate) fn reset(&mut self, now: i64) {
        self.then = now;
    }

    /// Current event cursor, in `[0, event_cnt)`.
    #[inline]
    pub(crate) fn event_seq(&self) -> usize {
        self.event_seq
    }

    /// Steps the event cursor. Returns `true` when it wraps to 0.
    #[inline]
    pub(crate) fn advance(&mut self) -> bool {
        self.event_seq += 1;
        if self.event_seq >= self.event_cnt {
            self.event_seq = 0;
            return true;
        }
        false
    }

    /// Schedules the next event a jittered interval after `now`.
    #[inline]
    pub(crate) fn reload(&mut self, now: i64, rng: &mut impl rand::RngCore) {
        self.then = now.wrapping_add(tempo::async_reload(rng, self.async_min) as i64);
    }
}

/// Per-input counters accumulated between credit returns.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct InputDiag {
    pub(crate) pub_cnt: u64,
    pub(crate) pub_sz: u64,
    pub(crate) ovrnp_cnt: u64,
    pub(crate) ovrnr_cnt: u64,
    pub(crate) malformed_cnt: u64,
}

impl InputDiag {
    /// Returns credits up to `seq` on `fseq` and moves the accumulated
    /// counters into its diag slots.
    pub(crate) fn flush(&mut self, fseq: &Fseq, seq: u64) {
        fseq.update(seq);
        for (slot, cnt) in [
            (DIAG_PUB_CNT, self.pub_cnt),
            (DIAG_PUB_SZ, self.pub_sz),
            (DIAG_OVRNP_CNT, self.ovrnp_cnt),
            (DIAG_OVRNR_CNT, self.ovrnr_cnt),
            (DIAG_MALFORMED_CNT, self.malformed_cnt),
        ] {
            if cnt != 0 {
                fseq.diag(slot).fetch_add(cnt, Ordering::Relaxed);
            }
        }
        *self = Self::default();
    }
}

/// Mirrors the tile counters into the cnc diag slots.
///
/// Plain stores: the tile is the only writer of these slots.
fn publish_stats(cnc: &Cnc, stats: &TileStats) {
    for (slot, val) in [
        (CNC_DIAG_FRAG_CNT, stats.frag_cnt),
        (CNC_DIAG_FRAG_SZ, stats.frag_sz),
        (CNC_DIAG_OVRNP_CNT, stats.ovrnp_cnt),
        (CNC_DIAG_OVRNR_CNT, stats.ovrnr_cnt),
        (CNC_DIAG_MALFORMED_CNT, stats.malformed_cnt),
        (CNC_DIAG_TS_DROP_CNT, stats.ts_drop_cnt),
        (CNC_DIAG_SINK_ERR_CNT, stats.sink_err_cnt),
        (CNC_DIAG_HOUSEKEEPING_CNT, stats.housekeeping_cnt),
    ] {
        cnc.diag(slot).store(val, Ordering::Relaxed);
    }
}

impl<S: CaptureSink> ArchiveTile<'_, S> {
    /// Runs one housekeeping event.
    ///
    /// Returns [`Step::Halt`] if the cnc asked the tile to stop.
    pub(crate) fn housekeep(&mut self) -> Step {
        self.stats.housekeeping_cnt += 1;

        if let Some(out) = self.out {
            out.seq_update(self.seq);
        }

        self.cnc.heartbeat(self.now);
        publish_stats(self.cnc, &self.stats);

        let signal = self.cnc.signal_query();
        match signal {
            CncSignal::Run => {}
            CncSignal::Halt => return Step::Halt,
            CncSignal::Ack => {
                debug!("cnc ack received");
            }
            other => {
                warn!(signal = %other, raw = other.as_raw(), "unexpected cnc signal; trying to resume");
            }
        }
        if signal != CncSignal::Run {
            // A halt raised since the query survives and is seen next time.
            let _ = self.cnc.signal_cas(signal, CncSignal::Run);
        }

        if let Some(input) = self.inputs.get(self.hk.event_seq()) {
            self.in_diag[input.idx()].flush(input.fseq(), input.seq());
            trace!(in_idx = input.idx(), seq = input.seq(), "credits returned");
        }

        if self.hk.advance() && self.inputs.len() > 1 {
            let swap_idx = self.rng.gen_range(0..self.inputs.len());
            self.inputs.swap(0, swap_idx);
        }

        let next = self.clock.now();
        self.hk.reload(self.now, &mut self.rng);
        self.now = next;
        Step::Continue
    }

    /// Returns final credits and diagnostics for every input.
    pub(crate) fn flush_inputs(&mut self) {
        for input in &self.inputs {
            self.in_diag[input.idx()].flush(input.fseq(), input.seq());
        }
        if let Some(out) = self.out {
            out.seq_update(self.seq);
        }
        publish_stats(self.cnc, &self.stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    #[test]
    fn due_handles_wrapping_ticks() {
        let min = PowerOfTwo::new(8).unwrap();
        let hk = Housekeeping::new(1, min, 100);
        assert!(hk.due(100));
        assert!(hk.due(101));
        assert!(!hk.due(99));

        let hk = Housekeeping::new(1, min, i64::MAX);
        assert!(hk.due(i64::MIN));
    }

    #[test]
    fn reload_is_relative_to_given_tick() {
        let mut rng = SmallRng::seed_from_u64(1);
        let mut hk = Housekeeping::new(1, PowerOfTwo::new(16).unwrap(), 0);
        for now in [0i64, 1_000, 50_000] {
            hk.reload(now, &mut rng);
            assert!(!hk.due(now + 15));
            assert!(hk.due(now + 32));
        }
    }

    #[test]
    fn cursor_wraps_after_event_cnt() {
        let mut hk = Housekeeping::new(3, PowerOfTwo::new(1).unwrap(), 0);
        assert_eq!(hk.event_seq(), 0);
        assert!(!hk.advance());
        assert!(!hk.advance());
        assert!(hk.advance());
        assert_eq!(hk.event_seq(), 0);

        // no inputs still gives one event slot
        let mut hk = Housekeeping::new(0, PowerOfTwo::new(1).unwrap(), 0);
        assert!(hk.advance());
    }

    #[test]
    fn input_diag_flush_accumulates_into_fseq() {
        let fseq = Fseq::new_heap(0).unwrap();
        let mut diag = InputDiag {
            pub_cnt: 3,
            pub_sz: 300,
            ovrnp_cnt: 1,
            ..InputDiag::default()
        };
        diag.flush(&fseq, 9);
        assert_eq!(fseq.query(), 9);
        assert_eq!(fseq.diag(DIAG_PUB_CNT).load(Ordering::Relaxed), 3);
        assert_eq!(fseq.diag(DIAG_PUB_SZ).load(Ordering::Relaxed), 300);
        assert_eq!(fseq.diag(DIAG_OVRNP_CNT).load(Ordering::Relaxed), 1);
        assert_eq!(diag.pub_cnt, 0);

        diag.pub_cnt = 2;
        diag.flush(&fseq, 11);
        assert_eq!(fseq.query(), 11);
        assert_eq!(fseq.diag(DIAG_PUB_CNT).load(Ordering::Relaxed), 5);
    }
}
