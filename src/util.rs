use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn ms_to_iso(ms: i64) -> Option<String> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

pub fn iso_to_ms(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Store timestamps arrive as epoch numbers, digit strings, or RFC 3339
/// strings. Normalize all three to one RFC 3339 representation.
pub fn to_iso_date(v: &Value) -> Option<String> {
    match v {
        Value::Number(n) => ms_to_iso(n.as_i64()?),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if s.chars().all(|c| c.is_ascii_digit()) {
                ms_to_iso(s.parse().ok()?)
            } else {
                ms_to_iso(iso_to_ms(s)?)
            }
        }
        _ => None,
    }
}

/// Epoch value as milliseconds. Ten-digit values are seconds, thirteen-digit
/// values already milliseconds.
pub fn to_ms(v: &Value) -> i64 {
    let n = match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse::<i64>().unwrap_or(0),
        _ => 0,
    };
    if n > 0 && n < 1_000_000_000_000 {
        n * 1000
    } else {
        n
    }
}

pub fn json_str(val: &Value, key: &str) -> Option<String> {
    val.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}
