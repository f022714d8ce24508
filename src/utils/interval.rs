use std::time::Duration;

use regex::Regex;

/// Parse an interval string of the form `<number>[s|m|h|d]`, e.g. `30s`,
/// `5m`, `2h`, `1d`. Returns `None` for anything else.
pub fn parse_interval(interval: &str) -> Option<Duration> {
    if interval.is_empty() {
        return None;
    }

    let pattern = Regex::new(r"^(\d+)([smhd])$").ok()?;
    let captures = pattern.captures(interval)?;

    let value: u64 = captures.get(1)?.as_str().parse().ok()?;
    let seconds = match captures.get(2)?.as_str() {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86400,
        _ => return None,
    };
    Some(Duration::from_secs(seconds))
}
