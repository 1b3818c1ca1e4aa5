//! Feed field schema.
//!
//! Feeds spell the same logical field in different ways. Each [`SourceField`]
//! carries an ordered alias list; [`FieldSchema::resolve`] looks the aliases up
//! once, at the ingestion boundary, and produces a typed [`RawFeedRow`].
//! Malformed values become `None` (or [`Bucket::Unknown`]) instead of failing
//! the row.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use stockline_db::Bucket;

/// Logical fields the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceField {
    Serial,
    Model,
    Bucket,
    State,
    Quantity,
    GroupingKey,
    StatusCode,
    MessageCode,
    LastSeenAt,
}

impl SourceField {
    pub const ALL: [SourceField; 9] = [
        SourceField::Serial,
        SourceField::Model,
        SourceField::Bucket,
        SourceField::State,
        SourceField::Quantity,
        SourceField::GroupingKey,
        SourceField::StatusCode,
        SourceField::MessageCode,
        SourceField::LastSeenAt,
    ];

    /// Built-in aliases, most specific first.
    #[must_use]
    pub fn default_aliases(&self) -> &'static [&'static str] {
        match self {
            SourceField::Serial => &["serial", "serial_number", "serialNumber", "sn", "serial_no"],
            SourceField::Model => &["model", "model_number", "modelNumber", "model_no", "sku"],
            SourceField::Bucket => &["bucket", "category", "inventory_type", "inventoryType"],
            SourceField::State => &["state", "status_label", "disposition"],
            SourceField::Quantity => &["quantity", "qty", "count", "units"],
            SourceField::GroupingKey => &[
                "grouping_key",
                "load_number",
                "loadNumber",
                "load",
                "route",
                "shipment",
            ],
            SourceField::StatusCode => &["status_code", "statusCode", "status"],
            SourceField::MessageCode => &["message_code", "messageCode", "message", "msg"],
            SourceField::LastSeenAt => &[
                "last_seen_at",
                "lastSeen",
                "last_seen",
                "scanned_at",
                "updated_at",
                "date",
            ],
        }
    }
}

/// A feed row after alias resolution.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawFeedRow {
    pub serial: Option<String>,
    pub model: Option<String>,
    pub bucket: Option<Bucket>,
    pub state: Option<String>,
    pub quantity: Option<i32>,
    pub grouping_key: Option<String>,
    pub status_code: Option<String>,
    pub message_code: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    /// The original object, kept for traceability.
    pub raw: Value,
}

/// Ordered alias lists per field.
#[derive(Debug, Clone)]
pub struct FieldSchema {
    aliases: HashMap<SourceField, Vec<String>>,
}

impl Default for FieldSchema {
    fn default() -> Self {
        let aliases = SourceField::ALL
            .into_iter()
            .map(|field| {
                let names = field
                    .default_aliases()
                    .iter()
                    .map(|alias| alias.to_lowercase())
                    .collect();
                (field, names)
            })
            .collect();
        Self { aliases }
    }
}

impl FieldSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a feed-specific alias with the highest precedence for `field`.
    #[must_use]
    pub fn with_alias(mut self, field: SourceField, alias: &str) -> Self {
        let names = self.aliases.entry(field).or_default();
        names.insert(0, alias.to_lowercase());
        self
    }

    /// Aliases for one field in precedence order.
    #[must_use]
    pub fn aliases(&self, field: SourceField) -> &[String] {
        self.aliases.get(&field).map(Vec::as_slice).unwrap_or_default()
    }

    /// Resolve every field of one feed row. Key matching is case-insensitive
    /// and the first alias holding a non-blank value wins.
    #[must_use]
    pub fn resolve(&self, row: &Map<String, Value>) -> RawFeedRow {
        let mut by_key: HashMap<String, &Value> = HashMap::with_capacity(row.len());
        for (key, value) in row {
            by_key.entry(key.to_lowercase()).or_insert(value);
        }

        let text = |field: SourceField| -> Option<String> {
            self.aliases(field)
                .iter()
                .filter_map(|alias| by_key.get(alias))
                .find_map(|value| value_as_text(value))
        };

        RawFeedRow {
            serial: text(SourceField::Serial),
            model: text(SourceField::Model),
            bucket: text(SourceField::Bucket).map(|raw| Bucket::parse_lenient(&raw)),
            state: text(SourceField::State),
            quantity: text(SourceField::Quantity).and_then(|raw| parse_quantity(&raw)),
            grouping_key: text(SourceField::GroupingKey),
            status_code: text(SourceField::StatusCode),
            message_code: text(SourceField::MessageCode),
            last_seen_at: text(SourceField::LastSeenAt).and_then(|raw| parse_timestamp(&raw)),
            raw: Value::Object(row.clone()),
        }
    }
}

/// Scalar JSON value as trimmed text; blanks, nulls and containers are absent.
fn value_as_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Parse a quantity. Integral floats ("3.0") are accepted.
#[must_use]
pub fn parse_quantity(raw: &str) -> Option<i32> {
    let raw = raw.trim();
    if let Ok(value) = raw.parse::<i64>() {
        return i32::try_from(value).ok();
    }
    let value = raw.parse::<f64>().ok()?;
    if value.fract() != 0.0 || !value.is_finite() {
        return None;
    }
    i32::try_from(value as i64).ok()
}

/// Parse a timestamp in any of the formats feeds send.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&ts));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|ts| Utc.from_utc_datetime(&ts));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_resolve_uses_aliases_case_insensitively() {
        let schema = FieldSchema::new();
        let row = schema.resolve(&object(json!({
            "SerialNumber": " sn-1 ",
            "MODEL": "WX100",
            "Qty": "3",
            "loadNumber": "L-9",
        })));

        assert_eq!(row.serial.as_deref(), Some("sn-1"));
        assert_eq!(row.model.as_deref(), Some("WX100"));
        assert_eq!(row.quantity, Some(3));
        assert_eq!(row.grouping_key.as_deref(), Some("L-9"));
    }

    #[test]
    fn test_first_non_blank_alias_wins() {
        let schema = FieldSchema::new();
        let row = schema.resolve(&object(json!({
            "serial": "   ",
            "sn": "ABC",
        })));
        assert_eq!(row.serial.as_deref(), Some("ABC"));
    }

    #[test]
    fn test_custom_alias_takes_precedence() {
        let schema = FieldSchema::new().with_alias(SourceField::Model, "item_code");
        let row = schema.resolve(&object(json!({ "model": "A", "item_code": "B" })));
        assert_eq!(row.model.as_deref(), Some("B"));
        assert_eq!(schema.aliases(SourceField::Model)[0], "item_code");
    }

    #[test]
    fn test_malformed_values_normalize_to_absent() {
        let schema = FieldSchema::new();
        let row = schema.resolve(&object(json!({
            "serial": "S1",
            "quantity": "lots",
            "last_seen_at": "yesterday",
            "bucket": "mystery",
            "model": ["not", "scalar"],
        })));

        assert_eq!(row.quantity, None);
        assert_eq!(row.last_seen_at, None);
        assert_eq!(row.bucket, Some(Bucket::Unknown));
        assert_eq!(row.model, None);
        assert_eq!(row.raw["quantity"], "lots");
    }

    #[test]
    fn test_numeric_values_become_text() {
        let schema = FieldSchema::new();
        let row = schema.resolve(&object(json!({ "serial": 12345, "qty": 2.0 })));
        assert_eq!(row.serial.as_deref(), Some("12345"));
        assert_eq!(row.quantity, Some(2));
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity(" 5 "), Some(5));
        assert_eq!(parse_quantity("4.0"), Some(4));
        assert_eq!(parse_quantity("4.5"), None);
        assert_eq!(parse_quantity("99999999999"), None);
        assert_eq!(parse_quantity(""), None);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2024-03-01T12:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T14:30:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01 12:30:00"), Some(expected));
        assert_eq!(
            parse_timestamp("2024-03-01"),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp(&expected.timestamp().to_string()), Some(expected));
        assert_eq!(parse_timestamp("03/01/2024"), None);
    }
}
