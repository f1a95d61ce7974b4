//! Tick source and housekeeping interval math.
//!
//! The tile measures time in nanosecond ticks from [`Tickcount`]. Its
//! housekeeping cadence is derived from a single `lazy` knob: the longest a
//! peer may wait for an update. With `event_cnt` housekeeping events sharing
//! that budget, each event is due about every `lazy / event_cnt` ticks,
//! jittered by up to 2x so peers never fall into lockstep with the tile.

use minstant::{Anchor, Instant};
use rand::RngCore;

/// Witness type for power-of-two values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PowerOfTwo(u64);

impl PowerOfTwo {
    /// Returns `Some` only for a non-zero power of two.
    #[must_use]
    pub const fn new(val: u64) -> Option<Self> {
        if val.is_power_of_two() {
            Some(Self(val))
        } else {
            None
        }
    }

    /// Largest power of two that is `<= val`, or `None` for zero.
    #[must_use]
    pub const fn floor(val: u64) -> Option<Self> {
        if val == 0 {
            None
        } else {
            Some(Self(1 << (63 - val.leading_zeros())))
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// `get() - 1`.
    #[inline]
    #[must_use]
    pub const fn mask(self) -> u64 {
        self.0 - 1
    }
}

/// Exclusive upper bound for `lazy` and `event_cnt` accepted by [`async_min`].
const ASYNC_LIMIT: u64 = 1 << 31;

/// Default `lazy` (ns) for a consumer that can have `cr_max` frags
/// outstanding.
///
/// Roughly the time a producer needs to burn through `cr_max` credits at
/// line rate, so the credit return lands before the producer stalls.
/// Saturates at `i64::MAX`.
#[must_use]
pub const fn lazy_default(cr_max: u64) -> i64 {
    if cr_max > (i64::MAX as u64 - 4) / 9 {
        return i64::MAX;
    }
    (1 + (9 * cr_max) / 4) as i64
}

/// Minimum ticks between housekeeping events.
///
/// The largest power of two `<= lazy / event_cnt`. Returns `None` when
/// `lazy` or `event_cnt` is outside `[1, 2^31)` or when `lazy < event_cnt`.
#[must_use]
pub fn async_min(lazy: i64, event_cnt: u64) -> Option<PowerOfTwo> {
    if !(1..ASYNC_LIMIT as i64).contains(&lazy) {
        return None;
    }
    if !(1..ASYNC_LIMIT).contains(&event_cnt) {
        return None;
    }
    PowerOfTwo::floor(lazy as u64 / event_cnt)
}

/// Ticks until the next housekeeping event, uniform in
/// `[async_min, 2 * async_min)`.
#[inline]
pub fn async_reload(rng: &mut impl RngCore, async_min: PowerOfTwo) -> u64 {
    async_min.get() + (rng.next_u64() & async_min.mask())
}

/// Monotonic nanosecond tick counter.
///
/// Ticks are nanoseconds since the Unix epoch as calibrated by `minstant`,
/// so the same value doubles as a heartbeat and a capture timestamp.
pub struct Tickcount {
    anchor: Anchor,
}

impl Tickcount {
    #[must_use]
    pub fn new() -> Self {
        Self {
            anchor: Anchor::new(),
        }
    }

    /// Current tick.
    #[inline]
    pub fn now(&self) -> i64 {
        Instant::now().as_unix_nanos(&self.anchor) as i64
    }
}

impl Default for Tickcount {
    fn default() -> Self {
        Self::new()
    }
}
