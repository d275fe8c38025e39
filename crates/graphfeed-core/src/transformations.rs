//! Per-attribute-type value codecs.
//!
//! Lookup is by the attribute's declared type name. Unregistered types use
//! the identity codec.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

/// Converts an attribute value to and from its stored form.
pub trait Transformation: Send + Sync {
    fn serialize(&self, value: &Value) -> Value;
    fn deserialize(&self, raw: &Value) -> Value;
}

/// `date`: RFC 3339 string in records, epoch milliseconds in documents.
///
/// Null stays null; anything that does not parse passes through unchanged.
pub struct DateTransformation;

impl Transformation for DateTransformation {
    fn serialize(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| Value::from(dt.timestamp_millis()))
                .unwrap_or_else(|_| value.clone()),
            _ => value.clone(),
        }
    }

    fn deserialize(&self, raw: &Value) -> Value {
        raw.as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)))
            .unwrap_or_else(|| raw.clone())
    }
}

pub struct IdentityTransformation;

impl Transformation for IdentityTransformation {
    fn serialize(&self, value: &Value) -> Value {
        value.clone()
    }

    fn deserialize(&self, raw: &Value) -> Value {
        raw.clone()
    }
}

pub fn lookup_transformation(attr_type: &str) -> &'static dyn Transformation {
    match attr_type {
        "date" => &DateTransformation,
        _ => &IdentityTransformation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn date_round_trip() {
        let codec = lookup_transformation("date");
        let stored = codec.serialize(&json!("2016-01-01T00:00:00.000Z"));
        assert_eq!(stored, json!(1_451_606_400_000_i64));
        assert_eq!(codec.deserialize(&stored), json!("2016-01-01T00:00:00.000Z"));
    }

    #[test]
    fn date_accepts_offsets() {
        let codec = lookup_transformation("date");
        assert_eq!(
            codec.serialize(&json!("2016-01-01T01:00:00+01:00")),
            json!(1_451_606_400_000_i64)
        );
    }

    #[test]
    fn date_is_null_safe_and_lenient() {
        let codec = lookup_transformation("date");
        assert_eq!(codec.serialize(&Value::Null), Value::Null);
        assert_eq!(codec.deserialize(&Value::Null), Value::Null);
        assert_eq!(codec.serialize(&json!("yesterday")), json!("yesterday"));
        assert_eq!(codec.deserialize(&json!("yesterday")), json!("yesterday"));
    }

    #[test]
    fn unknown_types_use_identity() {
        let codec = lookup_transformation("geometry");
        let value = json!({"lat": 1.5, "lng": 2.0});
        assert_eq!(codec.serialize(&value), value);
        assert_eq!(codec.deserialize(&value), value);
    }
}
