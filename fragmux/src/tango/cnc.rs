//! Command-and-control object.
//!
//! A supervisor and a tile share a cnc to drive the tile's lifecycle:
//!
//! ```text
//!            supervisor                 tile
//!  BOOT ───────────────────────────► run()  ──► RUN
//!  RUN  ──── signal(HALT) ─────────► next housekeeping: leave loop
//!  HALT ───────────────────────────► teardown ──► BOOT
//! ```
//!
//! While running, the tile heartbeats the cnc with its current tick and
//! mirrors its counters into the diag slots.
//!
//! ```text
//! offset 0     CncHeader   magic              (128 B)
//! offset 128   CncState    signal | heartbeat (128 B)
//! offset 256   DiagLine    diag[16]           (128 B)
//! ```

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use minstant::Instant;

use super::{DiagLine, JoinError, Timeout, header};
use crate::ipc::region::{self, Region};
use crate::ipc::{HeapRegion, SharedMemorySafe};

const CNC_MAGIC: u64 = 0x434E_435F_5F5F_5631; // "CNC___V1" in ASCII

const STATE_OFF: usize = 128;
const DIAG_OFF: usize = STATE_OFF + size_of::<CncState>();
const FOOTPRINT: usize = DIAG_OFF + size_of::<DiagLine>();

/// Lifecycle signal stored in a cnc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CncSignal {
    /// Running normally.
    Run,
    /// Not running; ready to be started.
    Boot,
    /// Terminated abnormally.
    Fail,
    /// Asked to stop.
    Halt,
    /// Archive specific: supervisor acknowledgement, tile keeps running.
    Ack,
    /// Any other raw value.
    Unknown(u64),
}

impl CncSignal {
    /// Decodes a raw signal value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        match raw {
            0 => Self::Run,
            1 => Self::Boot,
            2 => Self::Fail,
            3 => Self::Halt,
            4 => Self::Ack,
            other => Self::Unknown(other),
        }
    }

    /// Raw signal value.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        match self {
            Self::Run => 0,
            Self::Boot => 1,
            Self::Fail => 2,
            Self::Halt => 3,
            Self::Ack => 4,
            Self::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for CncSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run => f.write_str("run"),
            Self::Boot => f.write_str("boot"),
            Self::Fail => f.write_str("fail"),
            Self::Halt => f.write_str("halt"),
            Self::Ack => f.write_str("ack"),
            Self::Unknown(raw) => write!(f, "{raw}"),
        }
    }
}

impl std::str::FromStr for CncSignal {
    type Err = std::num::ParseIntError;

    /// Accepts a signal name (any case) or a raw decimal value.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "run" => Ok(Self::Run),
            "boot" => Ok(Self::Boot),
            "fail" => Ok(Self::Fail),
            "halt" => Ok(Self::Halt),
            "ack" => Ok(Self::Ack),
            other => other.parse().map(Self::from_raw),
        }
    }
}

#[repr(C, align(128))]
struct CncHeader {
    magic: AtomicU64,
}

#[repr(C, align(128))]
struct CncState {
    signal: AtomicU64,
    heartbeat: AtomicI64,
}

// SAFETY: repr(C), only atomics, all-zero is a valid value.
unsafe impl SharedMemorySafe for CncHeader {}
// SAFETY: repr(C), only atomics, all-zero is a valid value.
unsafe impl SharedMemorySafe for CncState {}

/// A joined command-and-control object.
pub struct Cnc {
    hdr: NonNull<CncHeader>,
    state: NonNull<CncState>,
    diag: NonNull<DiagLine>,
    _region: Box<dyn Region>,
}

// SAFETY: all pointers target the owned region, accessed only through
// atomics.
unsafe impl Send for Cnc {}
unsafe impl Sync for Cnc {}

impl fmt::Debug for Cnc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cnc")
            .field("signal", &self.signal_query())
            .field("heartbeat", &self.heartbeat_query())
            .finish()
    }
}

impl Cnc {
    /// Bytes needed for a cnc.
    #[must_use]
    pub const fn footprint() -> usize {
        FOOTPRINT
    }

    /// Formats `region` as a cnc in [`CncSignal::Boot`] with heartbeat
    /// `now` and zeroed diagnostics.
    ///
    /// # Errors
    ///
    /// The region errors of [`join`](Self::join).
    pub fn new(region: impl Region, now: i64) -> Result<Self, JoinError> {
        let cnc = Self::from_region(region)?;
        for slot in &cnc.diag_line().diag {
            slot.store(0, Ordering::Relaxed);
        }
        cnc.state().heartbeat.store(now, Ordering::Relaxed);
        cnc.state()
            .signal
            .store(CncSignal::Boot.as_raw(), Ordering::Relaxed);
        cnc.hdr().magic.store(CNC_MAGIC, Ordering::Release);
        Ok(cnc)
    }

    /// Formats a fresh heap-backed cnc.
    ///
    /// # Errors
    ///
    /// [`JoinError::Alloc`] if the allocation fails.
    pub fn new_heap(now: i64) -> Result<Self, JoinError> {
        let region = HeapRegion::new(FOOTPRINT).ok_or(JoinError::Alloc {
            object: "cnc",
            len: FOOTPRINT,
        })?;
        Self::new(region, now)
    }

    /// Joins a cnc previously formatted by [`new`](Self::new).
    ///
    /// # Errors
    ///
    /// Bad magic, misalignment, or a region smaller than the footprint.
    pub fn join(region: impl Region) -> Result<Self, JoinError> {
        let cnc = Self::from_region(region)?;
        let found = cnc.hdr().magic.load(Ordering::Acquire);
        if found != CNC_MAGIC {
            return Err(JoinError::BadMagic {
                object: "cnc",
                found,
            });
        }
        Ok(cnc)
    }

    fn from_region(region: impl Region) -> Result<Self, JoinError> {
        let hdr: &CncHeader = header(&region, "cnc", FOOTPRINT)?;
        let misaligned = || JoinError::Misaligned { object: "cnc" };
        let state: &CncState = region::view(&region, STATE_OFF).ok_or_else(misaligned)?;
        let diag: &DiagLine = region::view(&region, DIAG_OFF).ok_or_else(misaligned)?;

        Ok(Self {
            hdr: NonNull::from(hdr),
            state: NonNull::from(state),
            diag: NonNull::from(diag),
            _region: Box::new(region),
        })
    }

    fn hdr(&self) -> &CncHeader {
        // SAFETY: points into the owned region for the lifetime of self.
        unsafe { self.hdr.as_ref() }
    }

    fn state(&self) -> &CncState {
        // SAFETY: as above.
        unsafe { self.state.as_ref() }
    }

    fn diag_line(&self) -> &DiagLine {
        // SAFETY: as above.
        unsafe { self.diag.as_ref() }
    }

    /// Current signal.
    #[inline]
    pub fn signal_query(&self) -> CncSignal {
        CncSignal::from_raw(self.state().signal.load(Ordering::Acquire))
    }

    /// Raises `signal`.
    #[inline]
    pub fn signal(&self, signal: CncSignal) {
        self.state().signal.store(signal.as_raw(), Ordering::Release);
    }

    /// Raises `new` only if the signal is still `current`.
    ///
    /// Returns the signal found when it was not `current`.
    #[inline]
    pub fn signal_cas(&self, current: CncSignal, new: CncSignal) -> Result<(), CncSignal> {
        self.state()
            .signal
            .compare_exchange(
                current.as_raw(),
                new.as_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(CncSignal::from_raw)
    }

    /// Records a heartbeat at tick `now`.
    #[inline]
    pub fn heartbeat(&self, now: i64) {
        self.state().heartbeat.store(now, Ordering::Relaxed);
    }

    /// Tick of the most recent heartbeat.
    #[inline]
    pub fn heartbeat_query(&self) -> i64 {
        self.state().heartbeat.load(Ordering::Relaxed)
    }

    /// Diagnostic counter `idx`.
    ///
    /// # Panics
    ///
    /// If `idx >= DIAG_CNT`.
    #[inline]
    pub fn diag(&self, idx: usize) -> &AtomicU64 {
        &self.diag_line().diag[idx]
    }

    /// Spins until the signal is no longer `test` or `timeout` expires.
    ///
    /// Returns the last signal observed, which is `test` on timeout.
    pub fn wait(&self, test: CncSignal, timeout: Timeout) -> CncSignal {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        loop {
            let signal = self.signal_query();
            if signal != test {
                return signal;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return signal;
            }
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn signal_raw_round_trip_and_names() {
        for (signal, raw, name) in [
            (CncSignal::Run, 0, "run"),
            (CncSignal::Boot, 1, "boot"),
            (CncSignal::Fail, 2, "fail"),
            (CncSignal::Halt, 3, "halt"),
            (CncSignal::Ack, 4, "ack"),
        ] {
            assert_eq!(signal.as_raw(), raw);
            assert_eq!(CncSignal::from_raw(raw), signal);
            assert_eq!(signal.to_string(), name);
            assert_eq!(name.parse::<CncSignal>().unwrap(), signal);
        }
        assert_eq!(CncSignal::from_raw(99), CncSignal::Unknown(99));
        assert_eq!(CncSignal::Unknown(99).to_string(), "99");
        assert_eq!("HALT".parse::<CncSignal>().unwrap(), CncSignal::Halt);
        assert_eq!("7".parse::<CncSignal>().unwrap(), CncSignal::Unknown(7));
        assert!("bogus".parse::<CncSignal>().is_err());
    }

    #[test]
    fn new_boots_and_join_shares_state() {
        let region = Arc::new(HeapRegion::new(Cnc::footprint()).unwrap());
        let tile = Cnc::new(region.clone(), 1234).unwrap();
        let supervisor = Cnc::join(region).unwrap();

        assert_eq!(supervisor.signal_query(), CncSignal::Boot);
        assert_eq!(supervisor.heartbeat_query(), 1234);

        tile.signal(CncSignal::Run);
        tile.heartbeat(5678);
        tile.diag(3).store(9, Ordering::Relaxed);
        assert_eq!(supervisor.signal_query(), CncSignal::Run);
        assert_eq!(supervisor.heartbeat_query(), 5678);
        assert_eq!(supervisor.diag(3).load(Ordering::Relaxed), 9);
    }

    #[test]
    fn signal_cas_only_replaces_expected() {
        let cnc = Cnc::new_heap(0).unwrap();
        cnc.signal(CncSignal::Ack);
        assert_eq!(cnc.signal_cas(CncSignal::Ack, CncSignal::Run), Ok(()));
        assert_eq!(cnc.signal_query(), CncSignal::Run);

        cnc.signal(CncSignal::Halt);
        assert_eq!(
            cnc.signal_cas(CncSignal::Ack, CncSignal::Run),
            Err(CncSignal::Halt)
        );
        assert_eq!(cnc.signal_query(), CncSignal::Halt);
    }

    #[test]
    fn join_rejects_unformatted() {
        let region = HeapRegion::new(Cnc::footprint()).unwrap();
        assert!(matches!(
            Cnc::join(region),
            Err(JoinError::BadMagic { object: "cnc", .. })
        ));
    }

    #[test]
    fn wait_times_out_on_unchanged_signal() {
        let cnc = Cnc::new_heap(0).unwrap();
        let got = cnc.wait(CncSignal::Boot, Duration::from_millis(5).into());
        assert_eq!(got, CncSignal::Boot);
    }

    #[test]
    fn wait_sees_change_from_other_thread() {
        let cnc = Cnc::new_heap(0).unwrap();
        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(10));
                cnc.signal(CncSignal::Run);
            });
            let got = cnc.wait(CncSignal::Boot, Duration::from_secs(5).into());
            assert_eq!(got, CncSignal::Run);
        });
    }
}
