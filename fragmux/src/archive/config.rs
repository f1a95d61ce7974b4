//! Archive tile configuration.
//!
//! Three knobs shape the tile's housekeeping:
//!
//! - `cr_max`: frags a producer may run ahead of the tile. Only used to
//!   derive the default `lazy`; defaults to the shallowest input's depth.
//! - `lazy`: longest a peer should wait for an update (ns). Housekeeping
//!   events are spread so that every input's credit return and the cnc
//!   heartbeat land within roughly this interval.
//! - `seed`: seeds the jitter and fairness reshuffle, so runs with the same
//!   seed and inputs make the same scheduling choices.

use crate::tempo;

/// Default `cr_max` when the tile has no inputs to derive it from.
pub const DEFAULT_CR_MAX: u64 = 128;

/// Archive tile configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileConfig {
    /// Maximum producer credits; `0` derives it from the input depths.
    ///
    /// **Default**: 0
    pub cr_max: u64,

    /// Housekeeping laziness in nanoseconds; `<= 0` derives it from
    /// `cr_max`.
    ///
    /// **Default**: 0
    pub lazy: i64,

    /// Seed for housekeeping jitter and input reshuffles.
    ///
    /// **Default**: 0
    pub seed: u64,
}

impl TileConfig {
    /// Builder-style setter for `cr_max`.
    #[must_use]
    pub const fn with_cr_max(mut self, cr_max: u64) -> Self {
        self.cr_max = cr_max;
        self
    }

    /// Builder-style setter for `lazy`.
    #[must_use]
    pub const fn with_lazy(mut self, lazy: i64) -> Self {
        self.lazy = lazy;
        self
    }

    /// Builder-style setter for `seed`.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// `cr_max`, or the shallowest input depth when unset (`DEFAULT_CR_MAX`
    /// without inputs).
    #[must_use]
    pub fn resolved_cr_max(&self, min_in_depth: Option<u64>) -> u64 {
        match self.cr_max {
            0 => min_in_depth.unwrap_or(DEFAULT_CR_MAX),
            cr_max => cr_max,
        }
    }

    /// `lazy`, or [`tempo::lazy_default`] of `cr_max` when unset.
    #[must_use]
    pub fn resolved_lazy(&self, cr_max: u64) -> i64 {
        if self.lazy <= 0 {
            tempo::lazy_default(cr_max)
        } else {
            self.lazy
        }
    }
}
