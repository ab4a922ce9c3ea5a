//! Forward conversion: application JSON value → MySQLValue
//!
//! Used for every column without a converter when building INSERT, UPDATE,
//! DELETE and WHERE literals.

use mysql_async::Value;
use serde_json::Value as JsonValue;

/// MySQL value wrapper for type-safe conversions.
#[derive(Debug, Clone, PartialEq)]
pub struct MySQLValue(pub Value);

impl MySQLValue {
    /// Get the inner mysql_async::Value.
    pub fn into_inner(self) -> Value {
        self.0
    }

    /// Get a reference to the inner value.
    pub fn as_inner(&self) -> &Value {
        &self.0
    }
}

impl From<&JsonValue> for MySQLValue {
    fn from(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => MySQLValue(Value::NULL),

            // Boolean - MySQL uses TINYINT(1)
            JsonValue::Bool(b) => MySQLValue(Value::Int(if *b { 1 } else { 0 })),

            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    MySQLValue(Value::Int(i))
                } else if let Some(u) = n.as_u64() {
                    MySQLValue(Value::UInt(u))
                } else {
                    MySQLValue(Value::Double(n.as_f64().unwrap_or_default()))
                }
            }

            JsonValue::String(s) => MySQLValue(Value::Bytes(s.clone().into_bytes())),

            // Arrays and objects - stored as JSON text
            JsonValue::Array(_) | JsonValue::Object(_) => {
                MySQLValue(Value::Bytes(value.to_string().into_bytes()))
            }
        }
    }
}

impl From<JsonValue> for MySQLValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::String(s) => MySQLValue(Value::Bytes(s.into_bytes())),
            other => MySQLValue::from(&other),
        }
    }
}
