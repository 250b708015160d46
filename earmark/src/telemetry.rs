//! Tracing initialization for binaries and tests embedding the crate.
//!
//! The library itself only emits `tracing` events; hosts decide where they
//! go. This module offers the standard fmt-layer setup with an environment
//! filter so embedders do not have to repeat it.

use time::format_description::well_known::Rfc3339;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber honoring `RUST_LOG`, defaulting to `info`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    init_with_default_filter("info");
}

/// Install a formatting subscriber with an explicit fallback filter used
/// when `RUST_LOG` is not set.
pub fn init_with_default_filter(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(LocalTime::new(Rfc3339))
        .try_init();
}
