//! Logging setup and the process-wide debug flag.
//!
//! Inbound changefeed traffic is logged through [`traffic!`], which emits at
//! `debug` when the flag is on and at `trace` otherwise. Failures always go
//! through `tracing::error!`/`tracing::warn!` directly.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

static DEBUG: AtomicBool = AtomicBool::new(false);

pub fn set_debug(enabled: bool) {
    DEBUG.store(enabled, Ordering::Relaxed);
}

pub fn debug_enabled() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

/// Installs a `fmt` subscriber. `RUST_LOG` wins; otherwise `debug` when the
/// debug flag is set and `info` when it is not. Calling it twice is harmless.
pub fn init() {
    let fallback = if debug_enabled() { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already installed");
    }
}

macro_rules! traffic {
    ($($arg:tt)+) => {
        if $crate::logging::debug_enabled() {
            tracing::debug!($($arg)+);
        } else {
            tracing::trace!($($arg)+);
        }
    };
}

pub(crate) use traffic;
