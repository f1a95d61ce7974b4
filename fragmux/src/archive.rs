//! The archive tile.
//!
//! Drains frags from any number of input links and writes each validated
//! frag as one record to a [`CaptureSink`]. The tile is a single-threaded
//! busy poll:
//!
//! ```text
//!  ┌────────────── loop ──────────────────────────────────────────┐
//!  │ housekeeping due? ── yes ──► heartbeat, signal, credits      │
//!  │        │                         HALT ──► leave loop         │
//!  │ pick next input (round robin)                                │
//!  │ seqlock read: idle | overrun | torn | malformed | frag       │
//!  │ frag ──► sink.append(tsorig, payload)                        │
//!  └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The tile never blocks a producer. Producers that outrun it are detected
//! through the slot sequence numbers and the tile jumps ahead; producers
//! that want lossless delivery throttle on the fseq credits the tile
//! returns during housekeeping.
//!
//! Lifecycle is driven through a [`Cnc`]: the tile refuses to start unless
//! the cnc is in BOOT, raises RUN once running, leaves the loop on HALT and
//! puts the cnc back in BOOT after teardown.

mod config;
mod housekeeping;
pub mod input;

pub use config::{DEFAULT_CR_MAX, TileConfig};
pub use housekeeping::{
    CNC_DIAG_FRAG_CNT, CNC_DIAG_FRAG_SZ, CNC_DIAG_HOUSEKEEPING_CNT, CNC_DIAG_MALFORMED_CNT,
    CNC_DIAG_OVRNP_CNT, CNC_DIAG_OVRNR_CNT, CNC_DIAG_SINK_ERR_CNT, CNC_DIAG_TS_DROP_CNT,
};
pub use input::{IN_MAX, InputLink};

use rand::SeedableRng;
use rand::rngs::SmallRng;

use crate::pcapng::{CaptureSink, SinkError};
use crate::tango::mcache::Frag;
use crate::tango::{Cnc, CncSignal, Mcache};
use crate::tempo::{self, Tickcount};
use crate::trace::{debug, info, warn};

use housekeeping::{Housekeeping, InputDiag};
use input::{InputDescriptor, Poll};

/// Errors that prevent the tile from starting or stopping cleanly.
#[derive(Debug, thiserror::Error)]
pub enum TileError {
    #[error("{cnt} inputs exceeds the maximum of {max}")]
    TooManyInputs { cnt: usize, max: usize },
    /// The cnc was not in BOOT when the tile was created.
    #[error("cnc is not in boot (found {signal}); tile already running?")]
    NotBooted { signal: CncSignal },
    #[error("input {idx}: mcache depth {depth} is too large")]
    InputTooDeep { idx: usize, depth: u64 },
    /// `lazy` cannot be spread over `event_cnt` housekeeping events.
    #[error("lazy {lazy} ns is unusable with {event_cnt} housekeeping events")]
    BadLazy { lazy: i64, event_cnt: u64 },
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Counters kept by a running tile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileStats {
    /// Frags written to the sink.
    pub frag_cnt: u64,
    /// Payload bytes written to the sink.
    pub frag_sz: u64,
    /// Overruns found while polling a slot.
    pub ovrnp_cnt: u64,
    /// Overruns found after copying a frag (torn reads).
    pub ovrnr_cnt: u64,
    /// Frags skipped for addressing payload the tile cannot copy.
    pub malformed_cnt: u64,
    /// Frags dropped because `tsorig` does not fit a capture timestamp.
    pub ts_drop_cnt: u64,
    /// Frags the sink failed to record.
    pub sink_err_cnt: u64,
    /// Housekeeping events run.
    pub housekeeping_cnt: u64,
}

/// Whether the loop keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    Halt,
}

/// Multi-input frag archiver.
pub struct ArchiveTile<'a, S: CaptureSink> {
    cnc: &'a Cnc,
    inputs: Vec<InputDescriptor<'a>>,
    /// Indexed by [`InputDescriptor::idx`], not by poll order.
    in_diag: Vec<InputDiag>,
    in_cursor: usize,
    out: Option<&'a Mcache>,
    seq: u64,
    sink: S,
    scratch: Box<[u8]>,
    hk: Housekeeping,
    rng: SmallRng,
    clock: Tickcount,
    now: i64,
    stats: TileStats,
}

impl<'a, S: CaptureSink> ArchiveTile<'a, S> {
    /// Creates a tile draining `links` into `sink`.
    ///
    /// Each input starts at its producer's current sequence number; frags
    /// published before this call are not archived. When `out` is given,
    /// the tile advertises its record count on that mcache's sync word,
    /// starting from its current value.
    ///
    /// # Errors
    ///
    /// - [`TileError::TooManyInputs`] above [`IN_MAX`] links
    /// - [`TileError::NotBooted`] if the cnc is not in BOOT
    /// - [`TileError::InputTooDeep`] for a ring deeper than `u32::MAX`
    /// - [`TileError::BadLazy`] if the resolved `lazy` is unusable
    pub fn new(
        cnc: &'a Cnc,
        links: &[InputLink<'a>],
        out: Option<&'a Mcache>,
        sink: S,
        config: &TileConfig,
    ) -> Result<Self, TileError> {
        if links.len() > IN_MAX {
            return Err(TileError::TooManyInputs {
                cnt: links.len(),
                max: IN_MAX,
            });
        }

        let signal = cnc.signal_query();
        if signal != CncSignal::Boot {
            return Err(TileError::NotBooted { signal });
        }

        let (inputs, min_in_depth) = input::register(links)?;
        for (idx, link) in links.iter().enumerate() {
            debug!(
                in_idx = idx,
                depth = link.mcache.depth(),
                mtu = link.dcache.mtu(),
                seq = link.mcache.seq_query(),
                "input registered"
            );
        }

        let cr_max = config.resolved_cr_max(min_in_depth);
        let lazy = config.resolved_lazy(cr_max);
        let event_cnt = links.len().max(1) as u64;
        let async_min =
            tempo::async_min(lazy, event_cnt).ok_or(TileError::BadLazy { lazy, event_cnt })?;

        let scratch_sz = links.iter().map(|link| link.dcache.mtu()).max().unwrap_or(0);
        let seq = out.map_or(0, Mcache::seq_query);

        let clock = Tickcount::new();
        let now = clock.now();

        info!(
            in_cnt = links.len(),
            cr_max,
            lazy,
            async_min = async_min.get(),
            seed = config.seed,
            scratch_sz,
            "archive tile configured"
        );

        Ok(Self {
            cnc,
            in_diag: vec![InputDiag::default(); inputs.len()],
            inputs,
            in_cursor: 0,
            out,
            seq,
            sink,
            scratch: vec![0u8; scratch_sz].into_boxed_slice(),
            hk: Housekeeping::new(event_cnt as usize, async_min, now),
            rng: SmallRng::seed_from_u64(config.seed),
            clock,
            now,
            stats: TileStats::default(),
        })
    }

    /// Runs until the cnc is signalled HALT, then tears down.
    ///
    /// Teardown returns every input's final credits, closes the sink and
    /// leaves the cnc in BOOT.
    ///
    /// # Errors
    ///
    /// [`TileError::Sink`] if closing the sink failed. The cnc is back in
    /// BOOT either way.
    pub fn run(&mut self) -> Result<TileStats, TileError> {
        self.start();
        while self.step() == Step::Continue {}
        self.finish()
    }

    /// Counters so far.
    pub fn stats(&self) -> &TileStats {
        &self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Raises RUN and makes the first housekeeping event due at once.
    pub(crate) fn start(&mut self) {
        self.cnc.signal(CncSignal::Run);
        self.now = self.clock.now();
        self.hk.reset(self.now);
        info!(in_cnt = self.inputs.len(), "archive tile running");
    }

    /// One loop iteration: housekeeping if due, then one poll.
    #[inline]
    pub(crate) fn step(&mut self) -> Step {
        if self.hk.due(self.now) && self.housekeep() == Step::Halt {
            return Step::Halt;
        }

        if self.inputs.is_empty() {
            self.now = self.clock.now();
            return Step::Continue;
        }

        if self.in_cursor >= self.inputs.len() {
            self.in_cursor = 0;
        }
        let input = &mut self.inputs[self.in_cursor];
        self.in_cursor += 1;

        let in_idx = input.idx();
        let polled = input.poll(&mut self.scratch);
        let seq = input.seq();
        let diag = &mut self.in_diag[in_idx];

        match polled {
            Poll::Idle => {}
            Poll::Overrun { skipped } => {
                self.stats.ovrnp_cnt += 1;
                diag.ovrnp_cnt += 1;
                warn!(in_idx, skipped, seq, "overrun while polling; resyncing");
            }
            Poll::Torn { skipped } => {
                self.stats.ovrnr_cnt += 1;
                diag.ovrnr_cnt += 1;
                warn!(in_idx, skipped, seq, "overrun while reading; resyncing");
            }
            Poll::Malformed { chunk, sz } => {
                self.stats.malformed_cnt += 1;
                diag.malformed_cnt += 1;
                warn!(in_idx, chunk, sz, "frag payload out of bounds or over mtu; skipped");
            }
            Poll::Frag(frag) => {
                diag.pub_cnt += 1;
                diag.pub_sz += u64::from(frag.sz);
                self.emit(in_idx, &frag);
            }
        }

        self.now = self.clock.now();
        Step::Continue
    }

    /// Hands the frag in the front of the scratch buffer to the sink.
    fn emit(&mut self, in_idx: usize, frag: &Frag) {
        let Ok(ts) = i64::try_from(frag.tsorig) else {
            self.stats.ts_drop_cnt += 1;
            warn!(in_idx, seq = frag.seq, tsorig = frag.tsorig, "timestamp out of range; frag dropped");
            return;
        };

        let sz = frag.sz as usize;
        match self.sink.append(ts, &self.scratch[..sz]) {
            Ok(()) => {
                self.stats.frag_cnt += 1;
                self.stats.frag_sz += sz as u64;
                self.seq = self.seq.wrapping_add(1);
            }
            Err(err) => {
                self.stats.sink_err_cnt += 1;
                warn!(in_idx, seq = frag.seq, error = %err, "capture append failed");
            }
        }
    }

    /// Returns final credits, closes the sink and puts the cnc in BOOT.
    pub(crate) fn finish(&mut self) -> Result<TileStats, TileError> {
        self.flush_inputs();
        let closed = self.sink.close();
        self.cnc.signal(CncSignal::Boot);

        info!(
            frag_cnt = self.stats.frag_cnt,
            frag_sz = self.stats.frag_sz,
            ovrnp_cnt = self.stats.ovrnp_cnt,
            ovrnr_cnt = self.stats.ovrnr_cnt,
            "archive tile halted"
        );
        closed?;
        Ok(self.stats)
    }
}
