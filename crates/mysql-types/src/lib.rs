//! MySQL escaping, value conversions and column converters.
//!
//! # Structure
//!
//! - `escape`: identifier and literal escaping
//! - `forward`: application JSON value → `MySQLValue` (for INSERT/UPDATE/WHERE)
//! - `reverse`: MySQL values + column metadata → application JSON value
//! - `converter`: named per-column converters and their registry
//!
//! # Example
//!
//! ```rust,ignore
//! use mysql_types::{escape_id, escape_literal, ConverterRegistry, MySQLValue};
//! use serde_json::json;
//!
//! let value: MySQLValue = (&json!("Ann")).into();
//! assert_eq!(format!("{} = {}", escape_id("name"), escape_literal(value.as_inner())), "`name` = 'Ann'");
//!
//! let timestamp = ConverterRegistry::default().get("timestamp_t3").unwrap();
//! ```

pub mod converter;
pub mod escape;
pub mod forward;
pub mod reverse;

pub use converter::{
    Comparability, Converter, ConverterRegistry, GeometryWkt, JsonText, TimestampT3, UuidB16,
};
pub use escape::{escape_binary_literal, escape_id, escape_literal};
pub use forward::MySQLValue;
pub use reverse::{ConversionError, MySQLValueWithSchema};
