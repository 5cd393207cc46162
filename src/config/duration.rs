//! Human-readable durations for config values such as `lock_timeout: 30s`.

use crate::error::{Error, Result};
use std::time::Duration;

/// Parse a duration string like `"500ms"`, `"30s"`, `"2m"`, `"1h"`.
///
/// A bare number is taken as seconds. Returns `None` if the string cannot be
/// parsed.
///
/// ```
/// use portlease::config::parse_duration_string;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration_string("5s"), Some(Duration::from_secs(5)));
/// assert_eq!(parse_duration_string("250ms"), Some(Duration::from_millis(250)));
/// assert_eq!(parse_duration_string("2m"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_duration_string("30"), Some(Duration::from_secs(30)));
/// ```
pub fn parse_duration_string(s: &str) -> Option<Duration> {
    let s = s.trim();

    if s.is_empty() {
        return None;
    }

    // (digits, milliseconds per unit)
    let (digits, unit_ms) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (s, 1_000)
    };

    digits
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|v| v.checked_mul(unit_ms))
        .map(Duration::from_millis)
}

/// Resolve an optional duration field, falling back to `default` when unset.
pub(crate) fn duration_field(
    name: &str,
    value: Option<&str>,
    default: Duration,
) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(raw) => parse_duration_string(raw).ok_or_else(|| {
            Error::Validation(format!(
                "'{}' has invalid duration '{}' (expected e.g. 500ms, 30s, 2m)",
                name, raw
            ))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration_string("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration_string("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration_string("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(
            parse_duration_string("100ms"),
            Some(Duration::from_millis(100))
        );
        assert_eq!(parse_duration_string("10"), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_parse_duration_with_whitespace() {
        assert_eq!(
            parse_duration_string("  5s  "),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert_eq!(parse_duration_string(""), None);
        assert_eq!(parse_duration_string("abc"), None);
        assert_eq!(parse_duration_string("5x"), None);
        assert_eq!(parse_duration_string("-5s"), None);
    }

    #[test]
    fn test_duration_field_defaults_and_errors() {
        let default = Duration::from_secs(30);
        assert_eq!(duration_field("lock_timeout", None, default).unwrap(), default);
        assert_eq!(
            duration_field("lock_timeout", Some("2s"), default).unwrap(),
            Duration::from_secs(2)
        );
        let err = duration_field("lock_timeout", Some("soon"), default).unwrap_err();
        assert!(err.to_string().contains("lock_timeout"));
    }
}
