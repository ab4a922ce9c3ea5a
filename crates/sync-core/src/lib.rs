//! Core types for mysql-table-sync.
//!
//! This crate holds everything that is independent of the storage engine:
//!
//! - [`Record`], [`Options`], [`Update`] - what the upstream source sends
//! - [`TableSchema`] - columns, aliases and key of a synchronized table
//! - [`Query`] - OR-of-AND query objects and their [`Expression`] language
//! - in-process query evaluation ([`Query::matches`], [`Query::filter`])
//!
//! # Architecture
//!
//! ```text
//! sync-core (this crate)
//!    │
//!    ├─── mysql-types       (escaping, value conversion, converters)
//!    │
//!    └─── mysql-table-sync  (connections, SQL compilation, read/write)
//! ```
//!
//! # Example
//!
//! ```rust
//! use serde_json::json;
//! use sync_core::Query;
//!
//! let query = Query::try_from(json!([{ "age": [">=", 18] }])).unwrap();
//! let adult = json!({ "age": 30 }).as_object().cloned().unwrap();
//! assert!(query.matches(&adult));
//! ```

pub mod expression;
pub mod filter;
pub mod query;
pub mod schema;
pub mod values;

// Re-exports for convenience
pub use expression::{
    BoolOp, ComparisonOp, Expression, Function, FunctionCall, FunctionKind, Operand,
};
pub use filter::Truth;
pub use query::{Condition, Query, QueryError, Term};
pub use schema::{ColumnDefinition, ColumnSpec, SchemaError, TableSchema};
pub use values::{attribute, flow, Operation, Options, Record, Transaction, Update};
