//! Column converters.
//!
//! A converter translates one column between its application representation
//! and the value sent to MySQL. Converters are looked up by name from a
//! [`ConverterRegistry`] when a table binding is built; `NULL` never reaches
//! a converter in either direction.
//!
//! Built-in converters:
//!
//! - `uuid_b16`: UUID string ⇄ `BINARY(16)`
//! - `timestamp_t3`: epoch milliseconds ⇄ `DATETIME(3)`
//! - `json`: any JSON value ⇄ JSON text
//! - `geometry_wkt`: WKT text ⇄ geometry column

use crate::reverse::{extract_bytes, extract_datetime, extract_string};
use crate::{ConversionError, MySQLValueWithSchema};
use chrono::DateTime;
use mysql_async::Value;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// How stored values of a converted column relate to application values
/// under SQL comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparability {
    /// Stored values cannot be compared with converted literals
    Opaque,
    /// Equal application values are equal in storage
    Equality,
    /// Equality and ordering both carry over to storage
    Ordered,
}

/// Bidirectional value transformer for one column.
pub trait Converter: Send + Sync + fmt::Debug {
    /// Application value → value sent to MySQL.
    fn parse(&self, value: &JsonValue) -> Result<Value, ConversionError>;

    /// Value read from MySQL → application value.
    fn serialize(&self, value: MySQLValueWithSchema) -> Result<JsonValue, ConversionError>;

    /// SQL expression for an escaped literal of this column.
    fn wrap_literal(&self, literal: String) -> String {
        literal
    }

    /// SELECT expression for the escaped column, when the raw column is not readable.
    fn select_expression(&self, _column: &str) -> Option<String> {
        None
    }

    /// Which comparisons against converted literals are meaningful in SQL.
    fn comparability(&self) -> Comparability {
        Comparability::Opaque
    }

    /// Whether `value` has the application type of this column, so its
    /// converted literal compares in SQL as the value itself does in-process.
    fn is_application_value(&self, value: &JsonValue) -> bool {
        !value.is_null()
    }
}

/// Named converters, injected into table bindings.
#[derive(Clone)]
pub struct ConverterRegistry {
    converters: HashMap<String, Arc<dyn Converter>>,
}

impl ConverterRegistry {
    /// Registry without any converter.
    pub fn empty() -> Self {
        Self {
            converters: HashMap::new(),
        }
    }

    /// Registry holding the built-in converters.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("uuid_b16", UuidB16);
        registry.register("timestamp_t3", TimestampT3);
        registry.register("json", JsonText);
        registry.register("geometry_wkt", GeometryWkt);
        registry
    }

    /// Register a converter, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<String>, converter: impl Converter + 'static) {
        self.converters.insert(name.into(), Arc::new(converter));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Converter>> {
        self.converters.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.converters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConverterRegistry")
            .field("converters", &self.names())
            .finish()
    }
}

fn unexpected(expected: &str, actual: &JsonValue) -> ConversionError {
    ConversionError::UnexpectedJson {
        expected: expected.to_string(),
        actual: actual.clone(),
    }
}

// ============================================================================
// Built-in converters
// ============================================================================

/// UUID string stored as `BINARY(16)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidB16;

impl Converter for UuidB16 {
    fn parse(&self, value: &JsonValue) -> Result<Value, ConversionError> {
        let s = value.as_str().ok_or_else(|| unexpected("UUID string", value))?;
        let uuid = Uuid::parse_str(s).map_err(|e| ConversionError::InvalidUuid(format!("{s}: {e}")))?;
        Ok(Value::Bytes(uuid.as_bytes().to_vec()))
    }

    fn serialize(&self, value: MySQLValueWithSchema) -> Result<JsonValue, ConversionError> {
        let bytes = extract_bytes(&value.value)?;
        let uuid = Uuid::from_slice(&bytes)
            .map_err(|e| ConversionError::InvalidUuid(format!("{bytes:?}: {e}")))?;
        Ok(JsonValue::String(uuid.hyphenated().to_string()))
    }

    fn comparability(&self) -> Comparability {
        Comparability::Equality
    }

    fn is_application_value(&self, value: &JsonValue) -> bool {
        value.is_string()
    }
}

/// Epoch milliseconds stored as a UTC `DATETIME(3)` string.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampT3;

impl Converter for TimestampT3 {
    fn parse(&self, value: &JsonValue) -> Result<Value, ConversionError> {
        match value {
            JsonValue::Number(n) => {
                let millis = n.as_i64().ok_or_else(|| unexpected("epoch milliseconds", value))?;
                let dt = DateTime::from_timestamp_millis(millis)
                    .ok_or_else(|| ConversionError::InvalidDateTime(millis.to_string()))?;
                Ok(Value::Bytes(
                    dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string().into_bytes(),
                ))
            }
            // already in storage format
            JsonValue::String(s) => Ok(Value::Bytes(s.clone().into_bytes())),
            _ => Err(unexpected("epoch milliseconds", value)),
        }
    }

    fn serialize(&self, value: MySQLValueWithSchema) -> Result<JsonValue, ConversionError> {
        let dt = extract_datetime(&value.value)?;
        Ok(JsonValue::from(dt.and_utc().timestamp_millis()))
    }

    fn comparability(&self) -> Comparability {
        Comparability::Ordered
    }

    // Storage strings are accepted on write but compare as text, not time.
    fn is_application_value(&self, value: &JsonValue) -> bool {
        value.is_i64()
    }
}

/// Any JSON value stored as JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonText;

impl Converter for JsonText {
    fn parse(&self, value: &JsonValue) -> Result<Value, ConversionError> {
        Ok(Value::Bytes(value.to_string().into_bytes()))
    }

    fn serialize(&self, value: MySQLValueWithSchema) -> Result<JsonValue, ConversionError> {
        let s = extract_string(&value.value)?;
        Ok(serde_json::from_str(&s).unwrap_or(JsonValue::String(s)))
    }
}

/// Geometry column exchanged as WKT text.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeometryWkt;

impl Converter for GeometryWkt {
    fn parse(&self, value: &JsonValue) -> Result<Value, ConversionError> {
        let wkt = value.as_str().ok_or_else(|| unexpected("WKT string", value))?;
        Ok(Value::Bytes(wkt.as_bytes().to_vec()))
    }

    fn serialize(&self, value: MySQLValueWithSchema) -> Result<JsonValue, ConversionError> {
        Ok(JsonValue::String(extract_string(&value.value)?))
    }

    fn wrap_literal(&self, literal: String) -> String {
        format!("ST_GeomFromText({literal})")
    }

    fn select_expression(&self, column: &str) -> Option<String> {
        Some(format!("ST_AsText({column})"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mysql_async::consts::{ColumnFlags, ColumnType};
    use serde_json::json;

    fn stored(value: Value, column_type: ColumnType) -> MySQLValueWithSchema {
        MySQLValueWithSchema::new(value, column_type, ColumnFlags::empty())
    }

    #[test]
    fn test_registry_builtins() {
        let registry = ConverterRegistry::default();
        assert_eq!(
            registry.names(),
            vec!["geometry_wkt", "json", "timestamp_t3", "uuid_b16"]
        );
        assert!(registry.get("uuid_b16").is_some());
        assert!(registry.get("nope").is_none());
        assert!(ConverterRegistry::empty().get("uuid_b16").is_none());
    }

    #[test]
    fn test_timestamp_t3() {
        let parsed = TimestampT3.parse(&json!(1_700_000_000_000i64)).unwrap();
        assert_eq!(parsed, Value::Bytes(b"2023-11-14 22:13:20.000".to_vec()));

        let text = stored(
            Value::Bytes(b"2023-11-14 22:13:20.000".to_vec()),
            ColumnType::MYSQL_TYPE_DATETIME,
        );
        assert_eq!(TimestampT3.serialize(text).unwrap(), json!(1_700_000_000_000i64));

        let binary = stored(
            Value::Date(2023, 11, 14, 22, 13, 20, 123_000),
            ColumnType::MYSQL_TYPE_DATETIME,
        );
        assert_eq!(TimestampT3.serialize(binary).unwrap(), json!(1_700_000_000_123i64));
    }

    #[test]
    fn test_application_values() {
        assert!(TimestampT3.is_application_value(&json!(1_700_000_000_000i64)));
        assert!(!TimestampT3.is_application_value(&json!("1700000000000")));
        assert!(!TimestampT3.is_application_value(&json!(1.5)));
        assert!(UuidB16.is_application_value(&json!("67e55044-10b1-426f-9247-bb680e5fe0c8")));
        assert!(!UuidB16.is_application_value(&json!(7)));
        assert!(!JsonText.is_application_value(&JsonValue::Null));
    }

    #[test]
    fn test_uuid_b16() {
        let id = "67e55044-10b1-426f-9247-bb680e5fe0c8";
        let parsed = UuidB16.parse(&json!(id)).unwrap();
        let Value::Bytes(bytes) = &parsed else {
            panic!("expected bytes");
        };
        assert_eq!(bytes.len(), 16);

        let back = UuidB16
            .serialize(stored(parsed, ColumnType::MYSQL_TYPE_STRING))
            .unwrap();
        assert_eq!(back, json!(id));

        assert!(matches!(
            UuidB16.parse(&json!("not-a-uuid")),
            Err(ConversionError::InvalidUuid(_))
        ));
        assert!(matches!(
            UuidB16.parse(&json!(12)),
            Err(ConversionError::UnexpectedJson { .. })
        ));
    }

    #[test]
    fn test_geometry_wkt_sql() {
        assert_eq!(
            GeometryWkt.wrap_literal("'POINT(1 2)'".to_string()),
            "ST_GeomFromText('POINT(1 2)')"
        );
        assert_eq!(
            GeometryWkt.select_expression("`loc`").as_deref(),
            Some("ST_AsText(`loc`)")
        );
        assert_eq!(TimestampT3.select_expression("`t`"), None);
        assert_eq!(GeometryWkt.comparability(), Comparability::Opaque);
        assert_eq!(TimestampT3.comparability(), Comparability::Ordered);
    }

    #[test]
    fn test_json_text() {
        let parsed = JsonText.parse(&json!({"tags": ["a"]})).unwrap();
        let back = JsonText
            .serialize(stored(parsed, ColumnType::MYSQL_TYPE_BLOB))
            .unwrap();
        assert_eq!(back, json!({"tags": ["a"]}));
    }
}
