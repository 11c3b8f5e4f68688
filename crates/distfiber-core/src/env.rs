//! Environment variable helpers used by the runtime configuration
//!
//! ```ignore
//! use distfiber_core::env::{env_get, env_get_bool};
//!
//! let threads: usize = env_get("DISTFIBER_THREADS", 4);
//! let pin = env_get_bool("DISTFIBER_PIN_THREADS", false);
//! ```

use std::str::FromStr;

/// Parse `key` as `T`, falling back to `default` when unset or malformed
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T`; `None` when unset or malformed
#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean flag: "1", "true", "yes", "on" (any case) are true, any other
/// value is false, and an unset variable yields `default`
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
