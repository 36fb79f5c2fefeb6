//! Environment variable helpers used by the configuration layer.
//!
//! Unset or unparseable variables fall back to the supplied default; a
//! malformed override never aborts engine setup.

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or return `default`.
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// `Some(T)` only if `key` is set and parses.
#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Accepts "1", "true", "yes", "on" (any case) as true, "0", "false",
/// "no", "off" as false. Anything else yields `default`.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Milliseconds in `key` as a `Duration`.
pub fn env_get_millis(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}
