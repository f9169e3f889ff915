//! Small stateless helpers shared by the event parser: timestamp and duration
//! coercion, state-return tag splitting, and payload trimming.

use chrono::{DateTime, NaiveDateTime, Utc};
use log::warn;
use serde_json::Value;

/// Fields larger than this (serialized length, in bytes) are elided from the
/// normalized record and their key recorded in `trimmed` instead. The source
/// does not specify a threshold (see Open Questions) — this is a conservative
/// budget picked to keep one payload from dominating the normalized record.
pub const TRIM_THRESHOLD_BYTES: usize = 8192;

/// Parse `_stamp` into epoch seconds. Tries RFC3339 (with an offset) first,
/// then falls back to a naive `YYYY-MM-DDTHH:MM:SS[.fff]` parse treated as
/// UTC — event payloads routinely omit the offset entirely — before finally
/// giving up to "now".
pub fn parse_timestamp(stamp: Option<&Value>) -> i64 {
    if let Some(Value::String(s)) = stamp {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return dt.timestamp();
        }
        const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"];
        for fmt in NAIVE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                return naive.and_utc().timestamp();
            }
        }
        warn!("unparseable _stamp value: {s:?}, using current time");
    }
    Utc::now().timestamp()
}

/// Parse a duration value (numeric milliseconds, or a string like `"12.5 ms"`
/// or `"1.2 s"`) into milliseconds.
pub fn parse_duration(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            match s.find(|c: char| c.is_alphabetic()) {
                Some(idx) => {
                    let (num_part, unit) = s.split_at(idx);
                    let num: f64 = num_part.trim().parse().ok()?;
                    match unit.trim() {
                        "s" => Some(num * 1000.0),
                        "us" | "\u{b5}s" => Some(num / 1000.0),
                        _ => Some(num), // "ms" or unrecognized unit: assume ms
                    }
                }
                None => s.parse().ok(),
            }
        }
        _ => None,
    }
}

/// Split a state-return key of the shape `<module>_|-<id>_|-<name>_|-<fun>`
/// into `(state_id, state_fun, state_name)`. Malformed keys (wrong arity)
/// degrade to `None`s rather than panicking — the distillation still runs,
/// just without the id/name backfill.
pub fn split_state_tags(rtag: &str) -> (Option<String>, Option<String>, Option<String>) {
    let parts: Vec<&str> = rtag.split("_|-").collect();
    if parts.len() == 4 {
        (
            Some(parts[1].to_string()),
            Some(parts[3].to_string()),
            Some(parts[2].to_string()),
        )
    } else {
        (None, None, None)
    }
}

/// Split `fun_args` into positional args (stringified) and a keyword map.
/// Real event payloads encode kwargs as a trailing object in the args array;
/// any object element contributes to the keyword map, everything else is a
/// positional argument.
pub fn parse_state_fun_args(fun_args: &Value) -> (Vec<String>, serde_json::Map<String, Value>) {
    let mut args = Vec::new();
    let mut kwargs = serde_json::Map::new();

    if let Value::Array(items) = fun_args {
        for item in items {
            match item {
                Value::Object(map) => kwargs.extend(map.clone()),
                Value::String(s) => args.push(s.clone()),
                other => args.push(value_to_plain_string(other)),
            }
        }
    }

    (args, kwargs)
}

fn value_to_plain_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Walk the top-level payload and report which keys are too large to carry
/// through verbatim. Returns the trimmed key names in encounter order; the
/// caller is responsible for actually omitting the oversized value.
pub fn get_trimmed(payload: &serde_json::Map<String, Value>, skip: &[&str]) -> Vec<String> {
    let mut trimmed = Vec::new();
    for (key, value) in payload {
        if skip.contains(&key.as_str()) {
            continue;
        }
        let size = serde_json::to_string(value).map(|s| s.len()).unwrap_or(0);
        if size > TRIM_THRESHOLD_BYTES {
            trimmed.push(key.clone());
        }
    }
    trimmed
}
