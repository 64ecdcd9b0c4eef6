//! Duration parsing utilities.

use std::time::Duration;

use anyhow::Context;

/// Parse a duration string like "1h", "30m", "30s", "500ms" or "2.5".
/// Supports:
/// - Plain numbers (interpreted as seconds, fractions allowed): "300", "1.0"
/// - Milliseconds suffix: "500ms"
/// - Seconds suffix: "300s"
/// - Minutes suffix: "30m"
/// - Hours suffix: "1h"
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("Empty duration string");
    }

    // "ms" must be checked before "m" and "s"
    if let Some(num_str) = s.strip_suffix("ms") {
        let millis: u64 = num_str
            .parse()
            .with_context(|| format!("Invalid milliseconds value: {num_str}"))?;
        return Ok(Duration::from_millis(millis));
    }
    if let Some(num_str) = s.strip_suffix('h') {
        return whole_seconds(num_str, "hours", 3600);
    }
    if let Some(num_str) = s.strip_suffix('m') {
        return whole_seconds(num_str, "minutes", 60);
    }
    if let Some(num_str) = s.strip_suffix('s') {
        return whole_seconds(num_str, "seconds", 1);
    }

    // No suffix - treat as (possibly fractional) seconds
    let secs: f64 = s
        .parse()
        .with_context(|| format!("Invalid duration value: {s}"))?;
    Duration::try_from_secs_f64(secs).with_context(|| format!("Invalid duration value: {s}"))
}

fn whole_seconds(num_str: &str, unit: &str, secs_per_unit: u64) -> anyhow::Result<Duration> {
    let count: u64 = num_str
        .parse()
        .with_context(|| format!("Invalid {unit} value: {num_str}"))?;
    let secs = count
        .checked_mul(secs_per_unit)
        .with_context(|| format!("Duration of {num_str} {unit} is too large"))?;
    Ok(Duration::from_secs(secs))
}

/// Render a duration the way [`parse_duration`] reads it.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let secs = d.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_suffixes() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration(" 45 ").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_duration_fractional_seconds() {
        assert_eq!(parse_duration("1.0").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("2.5").unwrap(), Duration::from_millis(2500));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("1.5s").is_err());
        assert!(parse_duration("-3").is_err());
        assert!(parse_duration("10d").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_overflow() {
        let err = parse_duration("99999999999999999h").unwrap_err();
        assert!(err.to_string().contains("too large"), "{err}");
        assert!(parse_duration("999999999999999999m").is_err());
        assert!(parse_duration("1e300").is_err());
        assert_eq!(
            parse_duration(&format!("{}s", u64::MAX)).unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }
}
