use crate::errors::{VocalsError, VocalsResult};

/// Parse a boolean value from a string, supporting multiple formats
///
/// Accepts: "true", "false", "1", "0", "yes", "no" (case insensitive)
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Parse a value for `key`, reporting malformed input as a configuration error.
pub fn parse_value<T>(key: &str, raw: &str) -> VocalsResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| VocalsError::Config(format!("Invalid value for {key} ('{raw}'): {e}")))
}
