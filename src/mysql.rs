//! MySQL driver built on `mysql_async`.

pub mod client;

pub use client::{MySqlDriver, MySqlSession};
