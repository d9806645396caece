//! Configuration module: environment variables only (spec §4.7's
//! "ambient config" is `BMSERVICE_*` env vars, not a TOML pipeline
//! description — there is no declarative stage graph to load here).

pub mod env;

pub use env::{log_level, use_device_ids, ENV_LOG_LEVEL, ENV_USE_DEVICE};
