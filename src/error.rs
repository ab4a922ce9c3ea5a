//! Error types for mysql-table-sync.
//!
//! Write failures never surface as `Err`: they are reported downstream as
//! [`ErrorRecord`]s so that the sender of a batch can compensate. [`SyncError`]
//! covers misuse of the API itself.

use crate::binding::BindingError;
use crate::driver::StorageError;
use serde::Serialize;
use serde_json::Value;
use sync_core::{Operation, Options, Record};
use thiserror::Error;

/// Storage engine tag carried by every error record.
pub const ENGINE: &str = "mysql";

/// Errors returned by the synchronizer API.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The worker task is gone; the synchronizer was shut down.
    #[error("The {0} worker has stopped")]
    WorkerStopped(&'static str),

    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error("Table '{0}' not found in configuration")]
    TableNotFound(String),
}

/// Result type alias for synchronizer operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error taxonomy codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A key attribute is missing or null
    NullKeyAttribute,
    /// A converter rejected an attribute value
    InvalidValue,
    /// The storage engine rejected the statement
    StorageError,
}

/// Error emitted downstream in place of a confirmation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub code: ErrorCode,
    pub engine: &'static str,
    pub table: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_errno: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_sqlstate: Option<String>,

    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,

    /// Index of the offending value in the batch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_value: Option<Value>,

    pub operation: Operation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,

    /// The whole batch as received
    pub values: Vec<Value>,

    pub flow: &'static str,
    /// Flow of the first value of the batch
    pub error_flow: Value,
}

impl ErrorRecord {
    fn new(code: ErrorCode, table: &str, operation: Operation, message: String) -> Self {
        Self {
            code,
            engine: ENGINE,
            table: table.to_string(),
            storage_code: None,
            storage_errno: None,
            storage_sqlstate: None,
            message,
            sql: None,
            position: None,
            attribute: None,
            error_value: None,
            operation,
            sender: None,
            values: Vec::new(),
            flow: "error",
            error_flow: Value::Null,
        }
    }

    /// A key attribute of the value at `position` is missing or null.
    pub fn null_key(
        table: &str,
        operation: Operation,
        position: usize,
        attribute: &str,
        value: &Record,
    ) -> Self {
        Self {
            position: Some(position),
            attribute: Some(attribute.to_string()),
            error_value: Some(Value::Object(value.clone())),
            ..Self::new(
                ErrorCode::NullKeyAttribute,
                table,
                operation,
                format!("Key attribute \"{attribute}\" value must be defined"),
            )
        }
    }

    /// A converter rejected attribute `attribute` of the value at `position`.
    pub fn invalid_value(
        table: &str,
        operation: Operation,
        position: usize,
        attribute: &str,
        value: &Record,
        message: impl std::fmt::Display,
    ) -> Self {
        Self {
            position: Some(position),
            attribute: Some(attribute.to_string()),
            error_value: Some(Value::Object(value.clone())),
            ..Self::new(
                ErrorCode::InvalidValue,
                table,
                operation,
                format!("Invalid value for attribute \"{attribute}\": {message}"),
            )
        }
    }

    /// The storage engine failed `sql`.
    pub fn storage(table: &str, operation: Operation, error: &StorageError, sql: &str) -> Self {
        Self {
            storage_code: Some(error.code.clone()),
            storage_errno: error.errno,
            storage_sqlstate: error.sql_state.clone(),
            sql: Some(sql.to_string()),
            ..Self::new(ErrorCode::StorageError, table, operation, error.message.clone())
        }
    }

    /// Attach the batch the error belongs to and the sender to route it back to.
    pub fn with_batch(mut self, values: Vec<Value>, options: &Options) -> Self {
        self.error_flow = values
            .first()
            .and_then(value_flow)
            .cloned()
            .unwrap_or(Value::Null);
        self.values = values;
        self.sender = options.sender.clone();
        self
    }

    /// The error as a downstream record.
    pub fn to_record(&self) -> Record {
        match serde_json::to_value(self) {
            Ok(Value::Object(record)) => record,
            _ => Record::new(),
        }
    }
}

/// Flow of a batch value; updates carry it on their new state.
fn value_flow(value: &Value) -> Option<&Value> {
    let record = value.as_object()?;
    sync_core::flow(record).or_else(|| {
        record
            .get("new")
            .and_then(Value::as_object)
            .and_then(sync_core::flow)
    })
}
