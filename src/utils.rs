//! Shared utility functions used across the crate.

use anyhow::{anyhow, Result};
use std::time::Duration;

/// Parse a duration string (e.g., "30s", "500ms", "1m", "1h") into std::time::Duration.
///
/// Supported formats:
/// - `Nms` - milliseconds (e.g., "500ms")
/// - `Ns` - seconds (e.g., "30s", "1.5s")
/// - `Nm` - minutes (e.g., "5m")
/// - `Nh` - hours (e.g., "1h")
/// - Plain number - treated as milliseconds (e.g., "1000")
///
/// Returns `None` if the string cannot be parsed.
pub fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.ends_with("ms") {
        s.trim_end_matches("ms")
            .parse::<u64>()
            .ok()
            .map(Duration::from_millis)
    } else if s.ends_with('s') {
        s.trim_end_matches('s')
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(Duration::from_secs_f64)
    } else if s.ends_with('m') {
        s.trim_end_matches('m')
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|m| Duration::from_secs_f64(m * 60.0))
    } else if s.ends_with('h') {
        s.trim_end_matches('h')
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|h| Duration::from_secs_f64(h * 3600.0))
    } else {
        // Plain number means milliseconds
        s.parse::<u64>().ok().map(Duration::from_millis)
    }
}

/// Strict variant used by configuration validation: an unparseable duration
/// is a configuration error, not a silent default.
pub fn parse_duration(s: &str, context: &str) -> Result<Duration> {
    parse_duration_str(s).ok_or_else(|| anyhow!("invalid duration '{}' for {}", s, context))
}
