//! Structured logging setup (spec §4.7), in the shape the teacher's
//! `main.rs` expects of a `logging::init_logging` call but with an
//! `EnvFilter` built from `BMSERVICE_LOG_LEVEL`/`RUST_LOG` rather than a
//! single fixed level string.

use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber. `default_level` is used only
/// when neither `RUST_LOG` nor `BMSERVICE_LOG_LEVEL` is set.
pub fn init_logging(default_level: &str) {
    let directive = crate::config::log_level(default_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .ok();
}
