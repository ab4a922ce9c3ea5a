//! Test infrastructure
//!
//! - `fake`: scriptable in-memory driver used by unit and integration tests
//! - `container`: Docker-backed MySQL server for opt-in integration tests

pub mod container;
pub mod fake;

pub use container::MySQLContainer;
pub use fake::FakeDriver;

use crate::binding::TableBinding;
use mysql_types::ConverterRegistry;
use sync_core::ColumnSpec;

/// Binding of the `users` table used throughout the tests:
/// `id`, `name` and `created_at` exposed as `createdAt` (epoch milliseconds).
pub fn users_binding() -> TableBinding {
    let columns = vec![
        ColumnSpec::from("id"),
        ColumnSpec::from("name"),
        ColumnSpec::Detailed {
            id: "created_at".to_string(),
            alias: Some("createdAt".to_string()),
            converter: Some("timestamp_t3".to_string()),
        },
    ];

    match TableBinding::new("users", columns, vec!["id".to_string()], &ConverterRegistry::default()) {
        Ok(binding) => binding,
        Err(e) => panic!("users binding is valid: {e}"),
    }
}
