//! Logging helpers for the bridge.
//!
//! Thin wrappers over `tracing` so call sites read the same everywhere, plus the
//! subscriber setup used by `main`.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

static VERBOSE: AtomicBool = AtomicBool::new(false);

const DEFAULT_FILTER: &str = "coder_bridge=info,tower_http=warn";
const VERBOSE_FILTER: &str = "coder_bridge=debug,tower_http=debug";

/// Toggle verbose logging. Must be called before [`init`] to affect the filter.
pub fn set_verbose(verbose: bool) {
    VERBOSE.store(verbose, Ordering::Relaxed);
}

#[must_use]
pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the verbose flag. Calling this twice is
/// harmless; the second call only logs a warning.
pub fn init() {
    let fallback = if is_verbose() {
        VERBOSE_FILTER
    } else {
        DEFAULT_FILTER
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let init_result = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();

    if let Err(err) = init_result {
        tracing::warn!(error = %err, "tracing already initialized; skipping setup");
    }
}

pub fn info(message: impl AsRef<str>) {
    tracing::info!("{}", message.as_ref());
}

pub fn warn(message: impl AsRef<str>) {
    tracing::warn!("{}", message.as_ref());
}

pub fn debug(message: impl AsRef<str>) {
    tracing::debug!("{}", message.as_ref());
}
