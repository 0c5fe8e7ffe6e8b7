//! Shared utility functions used across the crate.

use std::time::Duration;

use crate::error::ConfigError;

/// Parse a duration string (e.g., "30s", "500ms", "1.5m", "1h") into std::time::Duration.
///
/// Supported formats:
/// - `Nms` - milliseconds (e.g., "500ms")
/// - `Ns` - seconds, fractional allowed (e.g., "30s", "0.5s")
/// - `Nm` - minutes (e.g., "5m")
/// - `Nh` - hours (e.g., "1h")
/// - Plain number - treated as milliseconds (e.g., "1000")
///
/// Returns `None` if the string cannot be parsed, is negative, or does not
/// fit in a `Duration` of `u64` nanoseconds (about 584 years).
pub fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    // Scale factors are in nanoseconds so "300ms" stays exact.
    let (number, scale) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1e6)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1e9)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60e9)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3600e9)
    } else {
        (s, 1e6)
    };

    let value = number.trim().parse::<f64>().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let nanos = (value * scale).round();
    if nanos >= u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(nanos as u64))
}

/// Like [`parse_duration_str`] but reports which config field was malformed.
pub fn parse_duration(field: &str, s: &str) -> Result<Duration, ConfigError> {
    parse_duration_str(s).ok_or_else(|| ConfigError::InvalidDuration {
        field: field.to_string(),
        value: s.to_string(),
    })
}

/// Parse an optional duration field, leaving `None` untouched.
pub fn parse_optional_duration(
    field: &str,
    s: Option<&str>,
) -> Result<Option<Duration>, ConfigError> {
    s.map(|s| parse_duration(field, s)).transpose()
}

/// Render a duration compactly for summaries ("1m5s", "350ms", "2.5s").
pub fn format_duration(d: Duration) -> String {
    let total_ms = d.as_millis();
    if total_ms < 1000 {
        return format!("{}ms", total_ms);
    }
    let secs = d.as_secs();
    if secs < 60 {
        let frac = d.as_secs_f64();
        return if (frac - secs as f64).abs() < 0.05 {
            format!("{}s", secs)
        } else {
            format!("{:.1}s", frac)
        };
    }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    match (h, s) {
        (0, 0) => format!("{}m", m),
        (0, _) => format!("{}m{}s", m, s),
        _ => format!("{}h{}m{}s", h, m, s),
    }
}
