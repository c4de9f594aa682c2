//! Record transformer
//!
//! Turns a nested record into a flat [`Row`]. Two mutually exclusive modes:
//!
//! - **metadata**: the `_sdc_*` columns are filled from the message and the
//!   receive time
//! - **strip** (default): any `_sdc_*` fields the tap already put in the
//!   record are removed
//!
//! Flattening then joins nested object keys with `__`. Keys keep the order
//! they have in the record at every level, so the same record always produces
//! the same row, column order included.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// One flat output row. Column order is insertion order.
pub type Row = Map<String, Value>;

/// Separator between the segments of a flattened column name
pub const KEY_SEPARATOR: &str = "__";

/// Column names at or above this length are abbreviated
pub const MAX_COLUMN_NAME_LEN: usize = 255;

pub const SDC_BATCHED_AT: &str = "_sdc_batched_at";
pub const SDC_DELETED_AT: &str = "_sdc_deleted_at";
pub const SDC_EXTRACTED_AT: &str = "_sdc_extracted_at";
pub const SDC_PRIMARY_KEY: &str = "_sdc_primary_key";
pub const SDC_RECEIVED_AT: &str = "_sdc_received_at";
pub const SDC_SEQUENCE: &str = "_sdc_sequence";
pub const SDC_TABLE_VERSION: &str = "_sdc_table_version";

/// Reserved metadata columns, in the order they are added to rows
pub const METADATA_COLUMNS: [&str; 7] = [
    SDC_BATCHED_AT,
    SDC_DELETED_AT,
    SDC_EXTRACTED_AT,
    SDC_PRIMARY_KEY,
    SDC_RECEIVED_AT,
    SDC_SEQUENCE,
    SDC_TABLE_VERSION,
];

/// How array values become cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayStrategy {
    /// The whole array is one JSON-encoded cell
    #[default]
    Stringify,
    /// Each element gets its own column, `key__0`, `key__1`, ...
    Index,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransformOptions {
    pub add_metadata_columns: bool,
    pub array_strategy: ArrayStrategy,
}

/// Message-level facts the metadata columns are built from
#[derive(Debug, Clone, Copy)]
pub struct RecordContext<'a> {
    pub key_properties: &'a [String],
    pub version: Option<i64>,
    pub time_extracted: Option<&'a str>,
    pub received_at: DateTime<Utc>,
}

/// Reshape one record into an output row
pub fn transform(mut record: Map<String, Value>, context: &RecordContext<'_>, options: &TransformOptions) -> Row {
    if options.add_metadata_columns {
        add_metadata_values(&mut record, context);
    } else {
        remove_metadata_values(&mut record);
    }

    flatten(&record, options.array_strategy)
}

fn add_metadata_values(record: &mut Map<String, Value>, context: &RecordContext<'_>) {
    let received_at = context.received_at.to_rfc3339_opts(SecondsFormat::Micros, true);
    let deleted_at = record.get(SDC_DELETED_AT).cloned().unwrap_or(Value::Null);

    record.insert(SDC_BATCHED_AT.to_string(), Value::String(received_at.clone()));
    record.insert(SDC_DELETED_AT.to_string(), deleted_at);
    record.insert(
        SDC_EXTRACTED_AT.to_string(),
        context.time_extracted.map_or(Value::Null, |t| Value::String(t.to_string())),
    );
    record.insert(SDC_PRIMARY_KEY.to_string(), json!(context.key_properties));
    record.insert(SDC_RECEIVED_AT.to_string(), Value::String(received_at));
    record.insert(SDC_SEQUENCE.to_string(), json!(context.received_at.timestamp_millis()));
    record.insert(SDC_TABLE_VERSION.to_string(), json!(context.version));
}

fn remove_metadata_values(record: &mut Map<String, Value>) {
    for column in METADATA_COLUMNS {
        record.remove(column);
    }
}

/// Add the metadata column declarations to a stream schema
pub fn extend_schema_with_metadata(schema: &Value) -> Value {
    let mut extended = schema.clone();
    let Some(root) = extended.as_object_mut() else {
        return extended;
    };

    let properties = root
        .entry("properties")
        .or_insert_with(|| Value::Object(Map::new()));

    if let Some(properties) = properties.as_object_mut() {
        let nullable_timestamp = json!({"type": ["null", "string"], "format": "date-time"});
        let nullable_string = json!({"type": ["null", "string"]});

        properties.insert(SDC_BATCHED_AT.to_string(), nullable_timestamp.clone());
        properties.insert(SDC_DELETED_AT.to_string(), nullable_string.clone());
        properties.insert(SDC_EXTRACTED_AT.to_string(), nullable_timestamp.clone());
        properties.insert(SDC_PRIMARY_KEY.to_string(), json!({"type": ["null", "array"]}));
        properties.insert(SDC_RECEIVED_AT.to_string(), nullable_timestamp);
        properties.insert(SDC_SEQUENCE.to_string(), json!({"type": ["integer"]}));
        properties.insert(SDC_TABLE_VERSION.to_string(), json!({"type": ["null", "integer"]}));
    }

    extended
}

/// Flatten nested objects into `parent__child` columns
pub fn flatten(record: &Map<String, Value>, strategy: ArrayStrategy) -> Row {
    let mut row = Row::new();
    let mut path = Vec::new();
    flatten_object(&mut row, &mut path, record, strategy);
    row
}

fn flatten_object(row: &mut Row, path: &mut Vec<String>, object: &Map<String, Value>, strategy: ArrayStrategy) {
    for (key, value) in object {
        path.push(key.clone());
        flatten_value(row, path, value, strategy);
        path.pop();
    }
}

fn flatten_value(row: &mut Row, path: &mut Vec<String>, value: &Value, strategy: ArrayStrategy) {
    match (value, strategy) {
        (Value::Object(child), _) => flatten_object(row, path, child, strategy),
        (Value::Array(items), ArrayStrategy::Index) => {
            for (idx, item) in items.iter().enumerate() {
                path.push(idx.to_string());
                flatten_value(row, path, item, strategy);
                path.pop();
            }
        },
        (Value::Array(_), ArrayStrategy::Stringify) => {
            row.insert(column_name(path), Value::String(value.to_string()));
        },
        (scalar, _) => {
            row.insert(column_name(path), scalar.clone());
        },
    }
}

/// Join path segments, abbreviating from the left while the name is too long
fn column_name(path: &[String]) -> String {
    let mut segments = path.to_vec();
    let mut idx = 0;

    while segments.join(KEY_SEPARATOR).len() >= MAX_COLUMN_NAME_LEN && idx < segments.len() {
        segments[idx] = abbreviate(&segments[idx]);
        idx += 1;
    }

    segments.join(KEY_SEPARATOR)
}

/// Camel-case the segment and keep what is not lowercase: `customer_order_lines`
/// -> `col`. Segments that leave fewer than two characters keep their first three.
fn abbreviate(segment: &str) -> String {
    let initials: String = segment
        .split('_')
        .flat_map(|word| {
            let mut chars = word.chars();
            chars.next().map(|c| c.to_ascii_uppercase()).into_iter().chain(chars)
        })
        .filter(|c| !c.is_ascii_lowercase())
        .collect();

    if initials.chars().count() > 1 {
        initials.to_lowercase()
    } else {
        segment.chars().take(3).collect::<String>().to_lowercase()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn context(key_properties: &[String]) -> RecordContext<'_> {
        RecordContext {
            key_properties,
            version: Some(7),
            time_extracted: Some("2024-01-01T00:00:00Z"),
            received_at: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        }
    }

    #[test]
    fn test_flatten_nested_objects() {
        let row = flatten(
            &object(json!({"b": 1, "a": {"z": true, "y": {"x": "deep"}}})),
            ArrayStrategy::Stringify,
        );

        let columns: Vec<_> = row.keys().cloned().collect();
        assert_eq!(columns, vec!["b", "a__z", "a__y__x"]);
        assert_eq!(row["a__y__x"], json!("deep"));
        assert_eq!(row["a__z"], json!(true));
    }

    #[test]
    fn test_flatten_stringifies_arrays() {
        let row = flatten(
            &object(json!({"tags": ["x", "y"], "matrix": [[1, 2], [3]]})),
            ArrayStrategy::Stringify,
        );

        assert_eq!(row["tags"], json!(r#"["x","y"]"#));
        assert_eq!(row["matrix"], json!("[[1,2],[3]]"));
    }

    #[test]
    fn test_flatten_index_strategy_expands_arrays() {
        let row = flatten(
            &object(json!({"tags": ["x", {"k": 1}]})),
            ArrayStrategy::Index,
        );

        let columns: Vec<_> = row.keys().cloned().collect();
        assert_eq!(columns, vec!["tags__0", "tags__1__k"]);
    }

    #[test]
    fn test_empty_nested_object_produces_no_column() {
        let row = flatten(&object(json!({"a": {}, "b": null})), ArrayStrategy::Stringify);
        assert_eq!(row.len(), 1);
        assert_eq!(row["b"], Value::Null);
    }

    #[test]
    fn test_long_column_names_are_abbreviated() {
        let parent = "customer_order_lines".repeat(7);
        let child = "x".repeat(130);
        let record = object(json!({ parent.clone(): { child.clone(): 1 } }));

        let row = flatten(&record, ArrayStrategy::Stringify);
        let name = row.keys().next().unwrap();

        assert!(name.len() < MAX_COLUMN_NAME_LEN);
        assert!(name.ends_with(&format!("__{child}")));
        assert!(!name.starts_with(&parent));
    }

    #[test]
    fn test_abbreviate() {
        assert_eq!(abbreviate("customer_order_lines"), "col");
        assert_eq!(abbreviate("customers"), "cus");
        assert_eq!(abbreviate("order2_lineItems"), "o2li");
    }

    #[test]
    fn test_strip_mode_removes_reserved_fields() {
        let record = object(json!({"id": 1, "_sdc_deleted_at": "2024-01-01", "_sdc_sequence": 4}));
        let row = transform(record, &context(&[]), &TransformOptions::default());

        assert_eq!(row.keys().collect::<Vec<_>>(), vec!["id"]);
    }

    #[test]
    fn test_metadata_mode_adds_reserved_columns() {
        let keys = vec!["id".to_string()];
        let record = object(json!({"id": 1, "_sdc_deleted_at": "2024-01-01T00:00:00Z"}));
        let options = TransformOptions {
            add_metadata_columns: true,
            ..TransformOptions::default()
        };

        let row = transform(record, &context(&keys), &options);

        for column in METADATA_COLUMNS {
            assert!(row.contains_key(column), "missing {column}");
        }
        assert_eq!(row[SDC_DELETED_AT], json!("2024-01-01T00:00:00Z"));
        assert_eq!(row[SDC_EXTRACTED_AT], json!("2024-01-01T00:00:00Z"));
        assert_eq!(row[SDC_PRIMARY_KEY], json!(r#"["id"]"#));
        assert_eq!(row[SDC_TABLE_VERSION], json!(7));
        assert_eq!(row[SDC_BATCHED_AT], json!("2024-01-02T03:04:05.000000Z"));
        assert_eq!(row[SDC_SEQUENCE], json!(1_704_164_645_000_i64));
    }

    #[test]
    fn test_extend_schema_with_metadata() {
        let schema = json!({"type": "object", "properties": {"id": {"type": "integer"}}});
        let extended = extend_schema_with_metadata(&schema);

        let properties = extended["properties"].as_object().unwrap();
        assert!(properties.contains_key("id"));
        for column in METADATA_COLUMNS {
            assert!(properties.contains_key(column), "missing {column}");
        }
        // The input schema is left untouched
        assert_eq!(schema["properties"].as_object().unwrap().len(), 1);
    }

    #[test]
    fn test_extend_schema_without_properties() {
        let extended = extend_schema_with_metadata(&json!({"type": "object"}));
        assert_eq!(extended["properties"].as_object().unwrap().len(), METADATA_COLUMNS.len());
    }
}
