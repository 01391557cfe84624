use chrono::{DateTime, TimeZone, Utc};
use serde::de::Deserializer;
use serde::{de, Deserialize};
use serde_json::Value;

/// Store timestamps arrive either as epoch milliseconds (possibly encoded as a
/// float) or as RFC 3339 strings.
pub fn de_utc_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    value_to_utc(&value).map_err(de::Error::custom)
}

pub fn de_opt_utc_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value_to_utc(&value).map(Some).map_err(de::Error::custom),
    }
}

fn value_to_utc(value: &Value) -> Result<DateTime<Utc>, String> {
    match value {
        Value::Number(_) => {
            let millis = value_to_i64(value)?;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| format!("timestamp out of range: {millis}"))
        }
        Value::String(text) => {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Ok(parsed.with_timezone(&Utc));
            }
            let millis = value_to_i64(value)?;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| format!("timestamp out of range: {millis}"))
        }
        other => Err(format!("expected timestamp, got {other}")),
    }
}

fn value_to_i64(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(number) => {
            if let Some(value) = number.as_i64() {
                return Ok(value);
            }
            if let Some(value) = number.as_f64() {
                return f64_to_i64(value);
            }
            Err(format!("unsupported JSON number: {number}"))
        }
        Value::String(text) => {
            if let Ok(value) = text.trim().parse::<i64>() {
                return Ok(value);
            }
            if let Ok(value) = text.trim().parse::<f64>() {
                return f64_to_i64(value);
            }
            Err(format!("invalid timestamp string: {text}"))
        }
        other => Err(format!("expected number, got {other}")),
    }
}

fn f64_to_i64(value: f64) -> Result<i64, String> {
    if !value.is_finite() {
        return Err(format!("non-finite float: {value}"));
    }
    if value < i64::MIN as f64 || value > i64::MAX as f64 {
        return Err(format!("float out of i64 range: {value}"));
    }
    // Sub-millisecond precision is irrelevant for ban windows.
    Ok(value.trunc() as i64)
}
