//! Duration parsing and formatting for configuration values

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Parse a duration string such as "100ms", "10s", "5m", "1h" or "1d".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration string".to_string());
    }

    let (num_str, unit) = s
        .find(|c: char| !c.is_ascii_digit())
        .map(|i| s.split_at(i))
        .unwrap_or((s, "s"));

    let num: u64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

    let multiplier = match unit.trim().to_lowercase().as_str() {
        "ms" => 1,
        "s" | "" => 1000,
        "m" => 60 * 1000,
        "h" => 60 * 60 * 1000,
        "d" => 24 * 60 * 60 * 1000,
        _ => return Err(format!("Unknown duration unit: {}", unit)),
    };

    num.checked_mul(multiplier)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("Duration value too large: {}", s))
}

/// Format a duration using the largest unit that divides it evenly.
pub fn format_duration(duration: &Duration) -> String {
    const SECOND: u128 = 1000;
    const MINUTE: u128 = 60 * SECOND;
    const HOUR: u128 = 60 * MINUTE;
    const DAY: u128 = 24 * HOUR;

    let millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }

    [(DAY, "d"), (HOUR, "h"), (MINUTE, "m"), (SECOND, "s")]
        .iter()
        .find(|(unit, _)| millis % unit == 0)
        .map(|(unit, suffix)| format!("{}{}", millis / unit, suffix))
        .unwrap_or_else(|| format!("{}ms", millis))
}

pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_duration(duration))
}

/// Deserialize a list of durations, e.g. a backoff schedule `[1s, 2s, 4s]`.
pub fn deserialize_duration_list<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<String> = Vec::deserialize(deserializer)?;
    raw.iter()
        .map(|s| parse_duration(s).map_err(serde::de::Error::custom))
        .collect()
}

pub fn serialize_duration_list<S>(
    durations: &[Duration],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_seq(durations.iter().map(format_duration))
}
