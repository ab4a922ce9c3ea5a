//! Reverse conversion: MySQL values → application JSON value
//!
//! The text protocol returns almost everything as bytes, so the column type
//! and flags reported with the result set decide how a value is read back.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use mysql_async::consts::{ColumnFlags, ColumnType};
use mysql_async::Value;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// MySQL value with schema information for type-aware conversion.
#[derive(Debug, Clone)]
pub struct MySQLValueWithSchema {
    /// The raw MySQL value.
    pub value: Value,
    /// The MySQL column type.
    pub column_type: ColumnType,
    /// Column flags (e.g., UNSIGNED, BINARY).
    pub column_flags: ColumnFlags,
}

/// Error during value conversion, in either direction.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Type mismatch: expected {expected}, got {actual:?}")]
    TypeMismatch { expected: String, actual: Value },
    #[error("Type mismatch: expected {expected}, got {actual}")]
    UnexpectedJson { expected: String, actual: JsonValue },
    #[error("Invalid UTF-8 in string: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("Invalid date/time value: {0}")]
    InvalidDateTime(String),
    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),
}

impl MySQLValueWithSchema {
    /// Create a new MySQLValueWithSchema.
    pub fn new(value: Value, column_type: ColumnType, column_flags: ColumnFlags) -> Self {
        Self {
            value,
            column_type,
            column_flags,
        }
    }

    /// Convert to the application representation.
    pub fn to_json(self) -> Result<JsonValue, ConversionError> {
        JsonValue::try_from(self)
    }

    fn is_binary(&self) -> bool {
        self.column_flags.contains(ColumnFlags::BINARY_FLAG)
    }

    fn is_unsigned(&self) -> bool {
        self.column_flags.contains(ColumnFlags::UNSIGNED_FLAG)
    }
}

impl TryFrom<MySQLValueWithSchema> for JsonValue {
    type Error = ConversionError;

    fn try_from(mv: MySQLValueWithSchema) -> Result<Self, Self::Error> {
        use ColumnType::*;

        // Handle NULL first
        if matches!(mv.value, Value::NULL) {
            return Ok(JsonValue::Null);
        }

        match mv.column_type {
            // Integer types
            MYSQL_TYPE_TINY | MYSQL_TYPE_SHORT | MYSQL_TYPE_INT24 | MYSQL_TYPE_LONG
            | MYSQL_TYPE_LONGLONG | MYSQL_TYPE_YEAR => {
                if mv.is_unsigned() {
                    Ok(JsonValue::from(extract_uint(&mv.value)?))
                } else {
                    Ok(JsonValue::from(extract_int(&mv.value)?))
                }
            }

            // Floating point
            MYSQL_TYPE_FLOAT | MYSQL_TYPE_DOUBLE => {
                let f = extract_float(&mv.value)?;
                Ok(serde_json::Number::from_f64(f)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null))
            }

            // Decimal - kept as string for precision
            MYSQL_TYPE_DECIMAL | MYSQL_TYPE_NEWDECIMAL => {
                Ok(JsonValue::String(extract_string(&mv.value)?))
            }

            // Date/time types
            MYSQL_TYPE_DATE | MYSQL_TYPE_NEWDATE => Ok(JsonValue::String(extract_date(&mv.value)?)),

            MYSQL_TYPE_TIME | MYSQL_TYPE_TIME2 => Ok(JsonValue::String(extract_time(&mv.value)?)),

            MYSQL_TYPE_DATETIME | MYSQL_TYPE_DATETIME2 | MYSQL_TYPE_TIMESTAMP
            | MYSQL_TYPE_TIMESTAMP2 => Ok(JsonValue::String(extract_datetime_string(&mv.value)?)),

            // JSON
            MYSQL_TYPE_JSON => {
                let s = extract_string(&mv.value)?;
                Ok(serde_json::from_str(&s).unwrap_or(JsonValue::String(s)))
            }

            // Set - comma separated members
            MYSQL_TYPE_SET => {
                let s = extract_string(&mv.value)?;
                let members = if s.is_empty() {
                    Vec::new()
                } else {
                    s.split(',').map(|v| JsonValue::String(v.to_string())).collect()
                };
                Ok(JsonValue::Array(members))
            }

            // Bit - BIT(1) reads as a boolean
            MYSQL_TYPE_BIT => {
                let bytes = extract_bytes(&mv.value)?;
                if bytes.len() == 1 && bytes[0] <= 1 {
                    Ok(JsonValue::Bool(bytes[0] == 1))
                } else {
                    Ok(JsonValue::String(BASE64.encode(bytes)))
                }
            }

            // Geometry - WKB, use a converter to read it as text
            MYSQL_TYPE_GEOMETRY => Ok(JsonValue::String(BASE64.encode(extract_bytes(&mv.value)?))),

            // Strings, blobs, enums and anything else
            _ => {
                if mv.is_binary() {
                    let bytes = extract_bytes(&mv.value)?;
                    Ok(JsonValue::String(match String::from_utf8(bytes) {
                        Ok(s) if !s.contains('\0') => s,
                        Ok(s) => BASE64.encode(s.into_bytes()),
                        Err(e) => BASE64.encode(e.into_bytes()),
                    }))
                } else {
                    Ok(JsonValue::String(extract_string(&mv.value)?))
                }
            }
        }
    }
}

/// Extract integer from MySQL Value.
fn extract_int(value: &Value) -> Result<i64, ConversionError> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::UInt(u) => i64::try_from(*u).map_err(|_| mismatch("integer", value)),
        Value::Bytes(b) => {
            let s = String::from_utf8(b.clone())?;
            s.parse().map_err(|_| mismatch("integer", value))
        }
        _ => Err(mismatch("integer", value)),
    }
}

/// Extract unsigned integer from MySQL Value.
fn extract_uint(value: &Value) -> Result<u64, ConversionError> {
    match value {
        Value::UInt(u) => Ok(*u),
        Value::Int(i) => u64::try_from(*i).map_err(|_| mismatch("unsigned integer", value)),
        Value::Bytes(b) => {
            let s = String::from_utf8(b.clone())?;
            s.parse().map_err(|_| mismatch("unsigned integer", value))
        }
        _ => Err(mismatch("unsigned integer", value)),
    }
}

/// Extract float from MySQL Value.
fn extract_float(value: &Value) -> Result<f64, ConversionError> {
    match value {
        Value::Float(f) => Ok(*f as f64),
        Value::Double(d) => Ok(*d),
        Value::Int(i) => Ok(*i as f64),
        Value::UInt(u) => Ok(*u as f64),
        Value::Bytes(b) => {
            let s = String::from_utf8(b.clone())?;
            s.parse().map_err(|_| mismatch("float", value))
        }
        _ => Err(mismatch("float", value)),
    }
}

/// Extract string from MySQL Value.
pub(crate) fn extract_string(value: &Value) -> Result<String, ConversionError> {
    match value {
        Value::Bytes(b) => Ok(String::from_utf8(b.clone())?),
        Value::Int(i) => Ok(i.to_string()),
        Value::UInt(u) => Ok(u.to_string()),
        Value::Float(f) => Ok(f.to_string()),
        Value::Double(d) => Ok(d.to_string()),
        _ => Err(mismatch("string", value)),
    }
}

/// Extract bytes from MySQL Value.
pub(crate) fn extract_bytes(value: &Value) -> Result<Vec<u8>, ConversionError> {
    match value {
        Value::Bytes(b) => Ok(b.clone()),
        _ => Err(mismatch("bytes", value)),
    }
}

/// Extract a `YYYY-MM-DD` date.
fn extract_date(value: &Value) -> Result<String, ConversionError> {
    match value {
        Value::Date(year, month, day, ..) => {
            NaiveDate::from_ymd_opt(*year as i32, *month as u32, *day as u32)
                .map(|d| d.format("%Y-%m-%d").to_string())
                .ok_or_else(|| ConversionError::InvalidDateTime(format!("{value:?}")))
        }
        Value::Bytes(_) => extract_string(value),
        _ => Err(mismatch("date", value)),
    }
}

/// Extract a `[-]HH:MM:SS[.ffffff]` time.
fn extract_time(value: &Value) -> Result<String, ConversionError> {
    match value {
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let hours = *days * 24 + *hours as u32;
            let sign = if *negative { "-" } else { "" };
            let mut s = format!("{sign}{hours:02}:{minutes:02}:{seconds:02}");
            if *micros > 0 {
                s.push_str(&format!(".{micros:06}"));
            }
            Ok(s)
        }
        Value::Bytes(_) => extract_string(value),
        _ => Err(mismatch("time", value)),
    }
}

/// Extract a `YYYY-MM-DD HH:MM:SS[.ffffff]` date-time.
fn extract_datetime_string(value: &Value) -> Result<String, ConversionError> {
    match value {
        Value::Date(..) => {
            let dt = extract_datetime(value)?;
            if dt.nanosecond() > 0 {
                Ok(dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string())
            } else {
                Ok(dt.format("%Y-%m-%d %H:%M:%S").to_string())
            }
        }
        Value::Bytes(_) => extract_string(value),
        _ => Err(mismatch("datetime", value)),
    }
}

/// Extract a naive date-time from a binary or text protocol value.
pub(crate) fn extract_datetime(value: &Value) -> Result<NaiveDateTime, ConversionError> {
    match value {
        Value::Date(year, month, day, hour, minute, second, micros) => {
            NaiveDate::from_ymd_opt(*year as i32, *month as u32, *day as u32)
                .and_then(|d| {
                    d.and_hms_micro_opt(*hour as u32, *minute as u32, *second as u32, *micros)
                })
                .ok_or_else(|| ConversionError::InvalidDateTime(format!("{value:?}")))
        }
        Value::Bytes(_) => {
            let s = extract_string(value)?;
            NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S%.f")
                .map_err(|e| ConversionError::InvalidDateTime(format!("{s}: {e}")))
        }
        _ => Err(mismatch("datetime", value)),
    }
}

fn mismatch(expected: &str, actual: &Value) -> ConversionError {
    ConversionError::TypeMismatch {
        expected: expected.to_string(),
        actual: actual.clone(),
    }
}
