//! Environment variable helpers for `PB_*` tunables.
//!
//! ```ignore
//! use pagebuf_core::env::{env_get, env_get_bool};
//!
//! let bits: u32 = env_get("PB_HASH_BITS", 8);
//! let stats = env_get_bool("PB_STATS", false);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or return `default` when unset or unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// "1", "true", "yes", "on" (any case) are true; any other set value is
/// false; unset gives `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Milliseconds variable as a `Duration`.
#[inline]
pub fn env_get_ms(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_get(key, default.as_millis() as u64))
}

#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
