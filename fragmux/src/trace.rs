//! Log macros used across the crate.
//!
//! `debug!`, `info!`, `trace!` and `warn!` come from `tracing` when the
//! `tracing` feature is enabled (the default). With the feature off they
//! swallow their arguments, and the poll loop builds without a subscriber
//! or any field formatting.

/// Installs the process-wide log subscriber.
///
/// Output goes to stderr so that `fragmux dump` and `status` can keep
/// stdout for their own records. The filter comes from `RUST_LOG`,
/// falling back to `fragmux=info`. Thread names are printed because the
/// tile and the load generators usually run on separate threads. Repeat
/// calls keep the subscriber installed first.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fragmux=info"));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_names(true)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

/// Logging is compiled out; nothing to install.
#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! discard {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use discard as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as trace;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as warn;
