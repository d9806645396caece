//! Environment-variable configuration (spec §4.7), grounded on `BMEnv.h`'s
//! `BMSERVICE_*` variables and `BMDeviceUtils.cpp::getAvailableDevices`.

use std::env;
use std::str::FromStr;

/// `BMSERVICE_USE_DEVICE`: space/comma-separated device ids to use. Unset or
/// empty means "use every device the runtime reports".
pub const ENV_USE_DEVICE: &str = "BMSERVICE_USE_DEVICE";

/// `BMSERVICE_LOG_LEVEL`: forwarded to `tracing_subscriber::EnvFilter` as
/// the default directive when `RUST_LOG` isn't set.
pub const ENV_LOG_LEVEL: &str = "BMSERVICE_LOG_LEVEL";

/// Parses `BMSERVICE_USE_DEVICE` into the requested device id set, dropping
/// (with a warning) any id `>= device_count`. Mirrors the original's
/// whitespace/non-digit-delimited parsing and out-of-range handling.
pub fn use_device_ids(device_count: u32) -> Vec<u32> {
    match env::var(ENV_USE_DEVICE) {
        Ok(raw) if !raw.trim().is_empty() => {
            let mut ids: Vec<u32> = split_id_list(&raw)
                .into_iter()
                .filter_map(|tok| match u32::from_str(&tok) {
                    Ok(id) if id < device_count => Some(id),
                    Ok(id) => {
                        tracing::warn!(device_id = id, device_count, "requested device id out of range, ignoring");
                        None
                    }
                    Err(_) => None,
                })
                .collect();
            ids.dedup();
            ids
        }
        _ => (0..device_count).collect(),
    }
}

/// Splits on any run of non-digit characters, mirroring the original's
/// tokenizer over `BMSERVICE_USE_DEVICE`.
fn split_id_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Reads `BMSERVICE_LOG_LEVEL` as an integer `0..=4` (`DEBUG, INFO, WARNING,
/// ERROR, FATAL`, spec §6) and maps it onto a `tracing` level name, folding
/// `FATAL` onto `ERROR` since `tracing` has no separate fatal level. Falls
/// back to `default_level` (typically `"info"`) if unset, empty, or not a
/// valid level integer.
pub fn log_level(default_level: &str) -> String {
    match env::var(ENV_LOG_LEVEL) {
        Ok(raw) => match raw.trim().parse::<u8>() {
            Ok(level) => level_name(level).unwrap_or_else(|| {
                tracing::warn!(raw = %raw, "BMSERVICE_LOG_LEVEL out of range 0..=4, ignoring");
                default_level.to_string()
            }),
            Err(_) => default_level.to_string(),
        },
        Err(_) => default_level.to_string(),
    }
}

/// Maps spec §6's `0..=4` log level integers onto `tracing` directive
/// names; `None` for anything outside that range.
fn level_name(level: u8) -> Option<String> {
    let name = match level {
        0 => "debug",
        1 => "info",
        2 => "warn",
        3 => "error",
        4 => "error", // FATAL folded onto ERROR: tracing has no fatal level.
        _ => return None,
    };
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_id_list_tokenizes_on_non_digits() {
        assert_eq!(split_id_list("1 2,3;4"), vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn split_id_list_ignores_empty_runs() {
        assert_eq!(split_id_list("  7   "), vec!["7"]);
    }

    #[test]
    fn level_name_maps_0_to_4_and_folds_fatal_to_error() {
        assert_eq!(level_name(0).as_deref(), Some("debug"));
        assert_eq!(level_name(1).as_deref(), Some("info"));
        assert_eq!(level_name(2).as_deref(), Some("warn"));
        assert_eq!(level_name(3).as_deref(), Some("error"));
        assert_eq!(level_name(4).as_deref(), Some("error"));
        assert_eq!(level_name(5), None);
    }
}
