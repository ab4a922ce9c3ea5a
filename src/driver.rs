//! Storage driver abstraction.
//!
//! The engine talks to MySQL only through [`Driver`] and [`Session`], so the
//! connection state machine, the writer and the reader can run against the
//! in-memory fake in [`crate::testing::fake`] as well as against
//! [`crate::mysql::client::MySqlDriver`].
//!
//! Every failure is reported as a [`StorageError`] carrying a classifiable
//! code (`ECONNREFUSED`, `PROTOCOL_CONNECTION_LOST`, `ER_DUP_ENTRY`, ...).

use crate::config::ConnectionOptions;
use async_trait::async_trait;
use mysql_async::consts::{ColumnFlags, ColumnType};
use mysql_async::Value;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Errors
// ============================================================================

/// Error reported by the storage engine or the transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct StorageError {
    /// Symbolic code, e.g. `ER_DUP_ENTRY` or `ECONNREFUSED`
    pub code: String,

    /// Server error number, if the error came from the server
    pub errno: Option<u16>,

    /// SQLSTATE, if the error came from the server
    pub sql_state: Option<String>,

    pub message: String,
}

impl StorageError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            errno: None,
            sql_state: None,
            message: message.into(),
        }
    }

    pub fn with_errno(mut self, errno: u16) -> Self {
        self.errno = Some(errno);
        self
    }

    pub fn with_sql_state(mut self, sql_state: impl Into<String>) -> Self {
        self.sql_state = Some(sql_state.into());
        self
    }

    pub fn class(&self) -> ErrorClass {
        ErrorClass::of(&self.code)
    }

    /// Whether the operation that hit this error should be resubmitted
    /// once a connection is available again.
    pub fn is_transient(&self) -> bool {
        self.class() != ErrorClass::Fatal
    }
}

/// Reconnection class of an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The session dropped; reconnect at once
    ConnectionLost,
    /// The server did not answer in time; reconnect after a short delay
    Timeout,
    /// The server cannot be reached; reconnect after a long delay
    Refused,
    /// Anything else; never retried
    Fatal,
}

impl ErrorClass {
    pub fn of(code: &str) -> Self {
        match code {
            "PROTOCOL_CONNECTION_LOST"
            | "PROTOCOL_ENQUEUE_AFTER_FATAL_ERROR"
            | "ECONNRESET"
            | "EPIPE"
            | "CR_SERVER_GONE_ERROR"
            | "CR_SERVER_LOST"
            | "ER_CLIENT_INTERACTION_TIMEOUT" => ErrorClass::ConnectionLost,
            "ETIMEDOUT" | "PROTOCOL_SEQUENCE_TIMEOUT" => ErrorClass::Timeout,
            "ECONNREFUSED" | "EHOSTUNREACH" | "ENETUNREACH" | "ENOTFOUND" | "EAI_AGAIN" => {
                ErrorClass::Refused
            }
            _ => ErrorClass::Fatal,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::ConnectionLost => "connection lost",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Refused => "refused",
            ErrorClass::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Results
// ============================================================================

/// Metadata of one result column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    pub name: String,
    pub column_type: ColumnType,
    pub flags: ColumnFlags,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            flags: ColumnFlags::empty(),
        }
    }

    pub fn with_flags(mut self, flags: ColumnFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Rows returned by a SELECT, in column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<Value>>,
}

// ============================================================================
// Traits
// ============================================================================

/// An established database session.
///
/// Statements issued on one session complete in submission order.
#[async_trait]
pub trait Session: Send + Sync {
    /// Execute a statement, returning the number of affected rows.
    async fn execute(&self, sql: &str) -> Result<u64, StorageError>;

    /// Execute a query, returning its rows.
    async fn query(&self, sql: &str) -> Result<ResultSet, StorageError>;

    /// Resolves with the error that broke this session.
    ///
    /// Never resolves for a healthy session.
    async fn closed(&self) -> StorageError;

    /// Close the session.
    async fn disconnect(&self) -> Result<(), StorageError>;
}

/// Opens sessions.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn Session>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(ErrorClass::of("PROTOCOL_CONNECTION_LOST"), ErrorClass::ConnectionLost);
        assert_eq!(ErrorClass::of("CR_SERVER_GONE_ERROR"), ErrorClass::ConnectionLost);
        assert_eq!(ErrorClass::of("ETIMEDOUT"), ErrorClass::Timeout);
        assert_eq!(ErrorClass::of("ECONNREFUSED"), ErrorClass::Refused);
        assert_eq!(ErrorClass::of("ENOTFOUND"), ErrorClass::Refused);
        assert_eq!(ErrorClass::of("ER_DUP_ENTRY"), ErrorClass::Fatal);
        assert_eq!(ErrorClass::of("ER_ACCESS_DENIED_ERROR"), ErrorClass::Fatal);
    }

    #[test]
    fn test_storage_error() {
        let error = StorageError::new("ER_DUP_ENTRY", "Duplicate entry '1' for key 'PRIMARY'")
            .with_errno(1062)
            .with_sql_state("23000");
        assert!(!error.is_transient());
        assert_eq!(error.errno, Some(1062));
        assert_eq!(
            error.to_string(),
            "ER_DUP_ENTRY: Duplicate entry '1' for key 'PRIMARY'"
        );

        assert!(StorageError::new("ECONNRESET", "reset").is_transient());
    }
}
