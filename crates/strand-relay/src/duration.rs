//! Heartbeat interval text format.
//!
//! The relay server tells the client its heartbeat interval as text inside
//! the handshake reply, e.g. `30s`, `1m30s` or `1h0m0s`, optionally with
//! `ms`, `us` and `ns` components and fractional values (`1.5s`).

use std::time::Duration;

/// Render a duration as `XhYmZs`, omitting leading zero units.
#[must_use]
pub fn format_interval(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    if d.subsec_nanos() != 0 {
        if d < Duration::from_secs(1) {
            if d.subsec_nanos() % 1_000_000 == 0 {
                return format!("{}ms", d.as_millis());
            }
            return format!("{}ns", d.as_nanos());
        }
        return format!("{}s", d.as_secs_f64());
    }

    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

/// Parse the text produced by [`format_interval`].
///
/// Returns `None` for empty input, unknown units or a zero duration.
#[must_use]
pub fn parse_interval(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let mut total_nanos = 0f64;
    let mut rest = text;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let value: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "h" => 3.6e12,
            "m" => 6e10,
            "s" => 1e9,
            "ms" => 1e6,
            "us" | "µs" => 1e3,
            "ns" => 1.0,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total_nanos += value * scale;
    }

    let nanos = total_nanos.round();
    if nanos < 1.0 || nanos >= u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(nanos as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format() {
        assert_eq!(format_interval(Duration::from_secs(30)), "30s");
        assert_eq!(format_interval(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_interval(Duration::from_secs(3600)), "1h0m0s");
        assert_eq!(format_interval(Duration::from_millis(250)), "250ms");
        assert_eq!(format_interval(Duration::from_millis(1500)), "1.5s");
    }

    #[test]
    fn test_parse() {
        assert_eq!(parse_interval("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_interval("1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_interval("1h0m0s"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_interval("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_interval("1.5s"), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_interval(""), None);
        assert_eq!(parse_interval("abc"), None);
        assert_eq!(parse_interval("10"), None);
        assert_eq!(parse_interval("5d"), None);
        assert_eq!(parse_interval("0s"), None);
    }
}
