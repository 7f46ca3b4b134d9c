//! Conversions from compose units to Kubernetes notation.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

const BINARY_SUFFIXES: &[&str] = &["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];

/// Fractional cores to millicores: `0.25` -> `250m`.
pub fn millicores(cores: f64) -> String {
    format!("{}m", (cores * 1000.0).round() as i64)
}

/// Bytes to a binary-SI quantity.
///
/// Exact multiples of 1024 use the largest suffix that keeps an integer
/// (`10Mi`, `1536Ki`). Anything else gets one decimal against the nearest
/// binary unit (`1.4Mi`). Values below 1Ki stay plain byte counts.
pub fn format_memory(bytes: u64) -> String {
    if bytes < 1024 { return bytes.to_string(); }
    if bytes % 1024 == 0 {
        let mut value = bytes / 1024;
        let mut idx = 0;
        while value % 1024 == 0 && idx + 1 < BINARY_SUFFIXES.len() {
            value /= 1024;
            idx += 1;
        }
        return format!("{}{}", value, BINARY_SUFFIXES[idx]);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut idx = 0;
    while value >= 1024.0 && idx + 1 < BINARY_SUFFIXES.len() {
        value /= 1024.0;
        idx += 1;
    }
    // 1023.96Ki rounds to 1024.0; promote so the output stays canonical.
    if (value * 10.0).round() >= 10240.0 && idx + 1 < BINARY_SUFFIXES.len() {
        value /= 1024.0;
        idx += 1;
    }
    format!("{:.1}{}", value, BINARY_SUFFIXES[idx])
}

static DURATION_PART: Lazy<Regex> = Lazy::new(|| Regex::new(r"([0-9]+(?:\.[0-9]+)?)(ns|us|µs|ms|s|m|h)").expect("static regex"));

/// Parse a Go-style duration (`1m30s`, `1.5s`, `250ms`). A bare `0` is zero.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s == "0" { return Some(Duration::ZERO); }
    if s.is_empty() { return None; }
    let mut total = 0f64;
    let mut consumed = 0usize;
    for cap in DURATION_PART.captures_iter(s) {
        let whole = cap.get(0)?;
        if whole.start() != consumed { return None; }
        consumed = whole.end();
        let n: f64 = cap[1].parse().ok()?;
        let nanos = match &cap[2] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            _ => 3600e9,
        };
        total += n * nanos;
    }
    if consumed != s.len() { return None; }
    Some(Duration::from_nanos(total.round() as u64))
}

/// Format the way Go's `time.Duration.String` does: `1h0m0s`, `1m30s`, `1.5s`, `250ms`.
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 { return "0s".to_string(); }
    if nanos < 1_000 { return format!("{}ns", nanos); }
    if nanos < 1_000_000 { return format!("{}µs", fraction(nanos, 1_000)); }
    if nanos < 1_000_000_000 { return format!("{}ms", fraction(nanos, 1_000_000)); }

    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let sub = d.subsec_nanos() as u128;
    let seconds = fraction(s as u128 * 1_000_000_000 + sub, 1_000_000_000);
    if h > 0 {
        format!("{}h{}m{}s", h, m, seconds)
    } else if m > 0 {
        format!("{}m{}s", m, seconds)
    } else {
        format!("{}s", seconds)
    }
}

fn fraction(value: u128, unit: u128) -> String {
    let whole = value / unit;
    let rest = value % unit;
    if rest == 0 { return whole.to_string(); }
    let width = unit.to_string().len() - 1;
    let digits = format!("{:0width$}", rest, width = width);
    format!("{}.{}", whole, digits.trim_end_matches('0'))
}

/// Re-render a compose duration in canonical Go form.
pub fn normalize_duration(s: &str) -> Option<String> {
    parse_duration(s).map(format_duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_to_millicores() {
        assert_eq!(millicores(0.25), "250m");
        assert_eq!(millicores(1.0), "1000m");
        assert_eq!(millicores(0.1), "100m");
    }

    #[test]
    fn memory_exact_and_fractional() {
        assert_eq!(format_memory(512), "512");
        assert_eq!(format_memory(10 * 1024 * 1024), "10Mi");
        assert_eq!(format_memory(1536 * 1024), "1536Ki");
        assert_eq!(format_memory(2 * 1024 * 1024 * 1024), "2Gi");
        assert_eq!(format_memory(1_468_006), "1.4Mi");
        assert_eq!(format_memory(1500), "1.5Ki");
        assert_eq!(format_memory(1_048_575), "1.0Mi");
    }

    #[test]
    fn durations_round_trip_go_style() {
        assert_eq!(normalize_duration("90s").as_deref(), Some("1m30s"));
        assert_eq!(normalize_duration("1m30s").as_deref(), Some("1m30s"));
        assert_eq!(normalize_duration("1h").as_deref(), Some("1h0m0s"));
        assert_eq!(normalize_duration("1.5s").as_deref(), Some("1.5s"));
        assert_eq!(normalize_duration("250ms").as_deref(), Some("250ms"));
        assert_eq!(normalize_duration("0").as_deref(), Some("0s"));
        assert_eq!(normalize_duration("10 seconds"), None);
        assert_eq!(normalize_duration("s10"), None);
    }
}
