//! PeerRecord <-> backend payload conversions.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::peer::{check_coordinates, PeerRecord, DEFAULT_LABEL};

/// Typed field map of a document, as the document REST API expects it.
pub fn document_fields(record: &PeerRecord) -> Value {
    json!({
        "name": { "stringValue": record.name },
        "latitude": { "doubleValue": record.latitude },
        "longitude": { "doubleValue": record.longitude },
        // 64-bit integers travel as strings.
        "timestamp": { "integerValue": record.timestamp.to_string() },
        "group": { "stringValue": record.group },
    })
}

pub fn record_from_document(id: &str, fields: &Value) -> Result<PeerRecord> {
    let record = PeerRecord {
        id: id.to_string(),
        name: string_field(fields, "name").unwrap_or_else(|| DEFAULT_LABEL.to_string()),
        latitude: double_field(fields, "latitude")?,
        longitude: double_field(fields, "longitude")?,
        timestamp: integer_field(fields, "timestamp")?,
        group: string_field(fields, "group").unwrap_or_else(|| DEFAULT_LABEL.to_string()),
    };
    check_coordinates(record.latitude, record.longitude)
        .with_context(|| format!("Document {}", id))?;
    Ok(record)
}

/// Last path segment of a full document resource name.
pub fn document_id(resource_name: &str) -> Option<&str> {
    resource_name.rsplit('/').next().filter(|id| !id.is_empty())
}

fn string_field(fields: &Value, key: &str) -> Option<String> {
    fields
        .get(key)?
        .get("stringValue")?
        .as_str()
        .map(str::to_string)
}

fn double_field(fields: &Value, key: &str) -> Result<f64> {
    let field = fields
        .get(key)
        .ok_or_else(|| anyhow!("Missing field '{}'", key))?;
    // Whole numbers written by other clients come back as integerValue.
    if let Some(v) = field.get("doubleValue").and_then(Value::as_f64) {
        return Ok(v);
    }
    if field.get("integerValue").is_some() {
        return Ok(integer_field(fields, key)? as f64);
    }
    Err(anyhow!("Field '{}' is not a number", key))
}

fn integer_field(fields: &Value, key: &str) -> Result<i64> {
    let value = fields
        .get(key)
        .and_then(|f| f.get("integerValue"))
        .ok_or_else(|| anyhow!("Missing integer field '{}'", key))?;
    match value {
        Value::String(s) => s
            .parse()
            .with_context(|| format!("Field '{}' is not an integer", key)),
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| anyhow!("Field '{}' is not an integer", key)),
        _ => Err(anyhow!("Field '{}' is not an integer", key)),
    }
}

/// Content of one installation's gist file. The gist layout carries no group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GistEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: i64,
}

pub fn gist_content(record: &PeerRecord) -> Result<String> {
    let entry = GistEntry {
        name: Some(record.name.clone()),
        latitude: record.latitude,
        longitude: record.longitude,
        timestamp: record.timestamp,
    };
    Ok(serde_json::to_string(&entry)?)
}

pub fn record_from_gist(id: &str, content: &str) -> Result<PeerRecord> {
    let entry: GistEntry =
        serde_json::from_str(content).with_context(|| format!("Gist file {}", id))?;
    check_coordinates(entry.latitude, entry.longitude)
        .with_context(|| format!("Gist file {}", id))?;
    Ok(PeerRecord {
        id: id.to_string(),
        name: entry.name.unwrap_or_else(|| DEFAULT_LABEL.to_string()),
        latitude: entry.latitude,
        longitude: entry.longitude,
        timestamp: entry.timestamp,
        group: DEFAULT_LABEL.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(now: i64) -> PeerRecord {
        PeerRecord {
            id: "testing-test".to_string(),
            name: "Testing Test".to_string(),
            latitude: 10.1,
            longitude: 20.2,
            timestamp: now,
            group: "test".to_string(),
        }
    }

    #[test]
    fn test_document_fields_layout() {
        let now = crate::peer::now_millis();
        let fields = document_fields(&sample(now));

        assert!(fields.get("uid").is_none());
        assert_eq!(fields["name"]["stringValue"], "Testing Test");
        assert_eq!(fields["latitude"]["doubleValue"], 10.1);
        assert_eq!(fields["longitude"]["doubleValue"], 20.2);
        assert_eq!(fields["timestamp"]["integerValue"], now.to_string());
        assert_eq!(fields["group"]["stringValue"], "test");
    }

    #[test]
    fn test_document_back_to_record() {
        let now = crate::peer::now_millis();
        let record = record_from_document("testing-test", &document_fields(&sample(now))).unwrap();
        assert_eq!(record, sample(now));
    }

    #[test]
    fn test_document_defaults_and_failures() {
        let fields = json!({
            "latitude": { "integerValue": "50" },
            "longitude": { "doubleValue": 40.2 },
            "timestamp": { "integerValue": 1700000000000i64 },
        });
        let record = record_from_document("123", &fields).unwrap();
        assert_eq!(record.name, "Guest");
        assert_eq!(record.group, "Guest");
        assert_eq!(record.latitude, 50.0);
        assert_eq!(record.timestamp, 1_700_000_000_000);

        let missing = json!({ "latitude": { "doubleValue": 1.0 } });
        assert!(record_from_document("123", &missing).is_err());

        let out_of_range = json!({
            "latitude": { "doubleValue": 123.0 },
            "longitude": { "doubleValue": 0.0 },
            "timestamp": { "integerValue": "1" },
        });
        assert!(record_from_document("123", &out_of_range).is_err());
    }

    #[test]
    fn test_document_id_from_resource_name() {
        assert_eq!(
            document_id("projects/p/databases/(default)/documents/location/abc"),
            Some("abc")
        );
        assert_eq!(document_id("abc"), Some("abc"));
        assert_eq!(document_id("location/"), None);
    }

    #[test]
    fn test_gist_content_has_no_group() {
        let content = gist_content(&sample(42)).unwrap();
        let value: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["latitude"], 10.1);
        assert_eq!(value["longitude"], 20.2);
        assert_eq!(value["name"], "Testing Test");
        assert_eq!(value["timestamp"], 42);
        assert!(value.get("group").is_none());
    }

    #[test]
    fn test_gist_record_parsing() {
        let record = record_from_gist(
            "234",
            r#"{"latitude":51.1,"longitude":41.2,"timestamp":5}"#,
        )
        .unwrap();
        assert_eq!(record.id, "234");
        assert_eq!(record.name, "Guest");
        assert_eq!(record.latitude, 51.1);

        assert!(record_from_gist("234", "Something").is_err());
        assert!(record_from_gist("234", r#"{"latitude":91,"longitude":0,"timestamp":5}"#).is_err());
    }
}
