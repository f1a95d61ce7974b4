//! Shared-memory messaging objects.
//!
//! Producers and the archive tile talk only through these objects, each laid
//! out inside a [`Region`](crate::ipc::Region):
//!
//! ```text
//!  producer                                  archive tile
//!  ────────                                  ────────────
//!  payload ──► Dcache (chunked bytes) ◄────── copy out
//!  meta ─────► Mcache (seq-stamped ring) ◄─── seqlock read
//!              Fseq (consumed seq) ◄───────── credit return
//!              Cnc (signal/heartbeat) ◄─────► supervisor
//! ```
//!
//! - [`mcache`] - Ring of frag metadata slots, each stamped with a sequence
//! - [`dcache`] - Payload store addressed in [`CHUNK_ALIGN`](dcache::CHUNK_ALIGN) units
//! - [`fseq`] - Consumer position plus per-link diagnostics
//! - [`cnc`] - Command-and-control signal, heartbeat and diagnostics
//!
//! Every object starts with a magic word written last by its creator.
//! `join` checks the magic, alignment and declared sizes before handing out
//! a typed handle, so a handle in hand is always a valid object.

pub mod cnc;
pub mod dcache;
pub mod fseq;
pub mod mcache;

pub use cnc::{Cnc, CncSignal};
pub use dcache::Dcache;
pub use fseq::Fseq;
pub use mcache::{FragMeta, Mcache};

use std::sync::atomic::AtomicU64;
use std::time::Duration;

use crate::ipc::region::{self, Region};
use crate::ipc::{REGION_ALIGN, SharedMemorySafe};

/// Number of diagnostic counters carried by [`Fseq`] and [`Cnc`].
pub const DIAG_CNT: usize = 16;

/// Errors raised when formatting or joining a tango object.
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    /// The region does not start with the expected magic word.
    #[error("{object}: bad magic {found:#018x}")]
    BadMagic { object: &'static str, found: u64 },
    /// The region base is not aligned for the object header.
    #[error("{object}: region is misaligned")]
    Misaligned { object: &'static str },
    /// The region is smaller than the object's footprint.
    #[error("{object}: region holds {have} bytes, need {need}")]
    TooSmall {
        object: &'static str,
        need: usize,
        have: usize,
    },
    /// Ring depth is not a power of two, is below the minimum, or is too
    /// large to address.
    #[error("mcache: depth {depth} is not a usable power of two")]
    BadDepth { depth: u64 },
    /// Object parameters are inconsistent.
    #[error("{object}: {reason}")]
    BadGeometry {
        object: &'static str,
        reason: &'static str,
    },
    /// A heap-backed object could not be allocated.
    #[error("{object}: failed to allocate {len} bytes")]
    Alloc { object: &'static str, len: usize },
}

/// Timeout specification for spinning waits.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Wait indefinitely.
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// A sequence word alone on its own cache-line pair.
///
/// Written by one side, polled by the other; the padding keeps neighbouring
/// fields from sharing its line.
#[repr(C, align(128))]
pub(crate) struct SeqLine {
    pub(crate) seq: AtomicU64,
}

/// Diagnostic counters, one line pair.
#[repr(C, align(128))]
pub(crate) struct DiagLine {
    pub(crate) diag: [AtomicU64; DIAG_CNT],
}

// SAFETY: repr(C), only atomics, all-zero is a valid value.
unsafe impl SharedMemorySafe for SeqLine {}
// SAFETY: repr(C), array of atomics, all-zero is a valid value.
unsafe impl SharedMemorySafe for DiagLine {}

const _: () = assert!(size_of::<SeqLine>() == 128);
const _: () = assert!(size_of::<DiagLine>() == 128);

/// Views the header of `object` at the start of `region`.
///
/// `need` is the smallest byte count any valid `object` can have.
pub(crate) fn header<'r, T: SharedMemorySafe>(
    region: &'r dyn Region,
    object: &'static str,
    need: usize,
) -> Result<&'r T, JoinError> {
    if region.base().as_ptr() as usize % REGION_ALIGN != 0 {
        return Err(JoinError::Misaligned { object });
    }
    if region.len() < need {
        return Err(JoinError::TooSmall {
            object,
            need,
            have: region.len(),
        });
    }
    region::view(region, 0).ok_or(JoinError::Misaligned { object })
}

/// Returns `true` if `seq_a` is strictly before `seq_b` in wrapping order.
#[inline]
#[must_use]
pub const fn seq_lt(seq_a: u64, seq_b: u64) -> bool {
    seq_diff(seq_a, seq_b) < 0
}

/// Wrapping signed distance `seq_a - seq_b`.
#[inline]
#[must_use]
pub const fn seq_diff(seq_a: u64, seq_b: u64) -> i64 {
    seq_a.wrapping_sub(seq_b) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_compare_wraps() {
        assert_eq!(seq_diff(5, 3), 2);
        assert_eq!(seq_diff(3, 5), -2);
        assert_eq!(seq_diff(0, u64::MAX), 1);
        assert_eq!(seq_diff(u64::MAX, 0), -1);
        assert!(seq_lt(u64::MAX, 0));
        assert!(!seq_lt(7, 7));
    }

    #[test]
    fn join_error_messages_name_the_object() {
        let err = JoinError::TooSmall {
            object: "dcache",
            need: 256,
            have: 128,
        };
        assert_eq!(err.to_string(), "dcache: region holds 128 bytes, need 256");

        let err = JoinError::BadMagic {
            object: "cnc",
            found: 0,
        };
        assert_eq!(err.to_string(), "cnc: bad magic 0x0000000000000000");
    }
}
