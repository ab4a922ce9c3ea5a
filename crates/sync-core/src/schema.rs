//! Table schema definitions.
//!
//! A table is described by an ordered list of columns and a key. Each column
//! maps a storage column name (`id`) to an application attribute name
//! (`alias`) and may name a converter. Columns are given either as a bare
//! column name or as an object:
//!
//! ```yaml
//! columns:
//!   - id
//!   - name
//!   - id: created_at
//!     as: createdAt
//!     converter: timestamp_t3
//! key: [id]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Error Types
// ============================================================================

/// Error type for schema operations.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// Table name is empty
    #[error("Table name must not be empty")]
    EmptyTableName,

    /// Column with an empty storage name
    #[error("Column at position {0} has an empty id")]
    EmptyColumnId(usize),

    /// Two columns share the same application attribute name
    #[error("Attribute '{0}' is declared by more than one column")]
    DuplicateAlias(String),

    /// No key attribute given
    #[error("Key must contain at least one attribute")]
    EmptyKey,

    /// Key attribute not declared by any column
    #[error(
        "Key attribute '{attribute}' is not defined in columns (after optional aliasing). \
         If a column has an alias (the \"as\" attribute) and is part of the key, the alias \
         is the name of the attribute that must be part of the key. \
         Key: [{key}]. Aliased columns: [{aliases}]"
    )]
    UnknownKeyAttribute {
        attribute: String,
        key: String,
        aliases: String,
    },
}

// ============================================================================
// Column Types
// ============================================================================

/// Column as written in configuration: a bare name or a detailed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnSpec {
    /// Column whose storage name is also its attribute name
    Name(String),

    /// Column with optional alias and converter
    Detailed {
        /// Storage column name
        id: String,

        /// Application attribute name, defaults to `id`
        #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
        alias: Option<String>,

        /// Name of a registered converter
        #[serde(default, skip_serializing_if = "Option::is_none")]
        converter: Option<String>,
    },
}

impl From<&str> for ColumnSpec {
    fn from(name: &str) -> Self {
        ColumnSpec::Name(name.to_string())
    }
}

/// Resolved column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    /// Storage column name
    pub id: String,

    /// Application attribute name
    pub alias: String,

    /// Converter name, if any
    pub converter: Option<String>,
}

impl ColumnDefinition {
    /// Create a column whose attribute name equals its storage name.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            alias: id.clone(),
            id,
            converter: None,
        }
    }

    /// Set the application attribute name.
    pub fn aliased(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    /// Set the converter name.
    pub fn with_converter(mut self, converter: impl Into<String>) -> Self {
        self.converter = Some(converter.into());
        self
    }

    /// Whether the column is renamed between storage and application.
    pub fn is_aliased(&self) -> bool {
        self.id != self.alias
    }
}

impl From<ColumnSpec> for ColumnDefinition {
    fn from(spec: ColumnSpec) -> Self {
        match spec {
            ColumnSpec::Name(id) => ColumnDefinition::new(id),
            ColumnSpec::Detailed {
                id,
                alias,
                converter,
            } => ColumnDefinition {
                alias: alias.unwrap_or_else(|| id.clone()),
                id,
                converter,
            },
        }
    }
}

// ============================================================================
// Table Schema
// ============================================================================

/// Validated table schema: ordered columns plus key attributes.
#[derive(Debug, Clone)]
pub struct TableSchema {
    /// Table name (unescaped)
    pub name: String,

    /// Columns in declaration order
    pub columns: Vec<ColumnDefinition>,

    /// Key attributes (application names)
    pub key: Vec<String>,

    /// Cached alias lookup
    by_alias: HashMap<String, usize>,
}

impl TableSchema {
    /// Build a schema, rejecting keys that do not resolve to a column.
    pub fn new(
        name: impl Into<String>,
        columns: impl IntoIterator<Item = ColumnSpec>,
        key: Vec<String>,
    ) -> Result<Self, SchemaError> {
        let name = name.into();
        if name.is_empty() {
            return Err(SchemaError::EmptyTableName);
        }

        let columns: Vec<ColumnDefinition> = columns.into_iter().map(Into::into).collect();

        let mut by_alias = HashMap::with_capacity(columns.len());
        for (position, column) in columns.iter().enumerate() {
            if column.id.is_empty() {
                return Err(SchemaError::EmptyColumnId(position));
            }
            if by_alias.insert(column.alias.clone(), position).is_some() {
                return Err(SchemaError::DuplicateAlias(column.alias.clone()));
            }
        }

        if key.is_empty() {
            return Err(SchemaError::EmptyKey);
        }

        if let Some(attribute) = key.iter().find(|a| !by_alias.contains_key(a.as_str())) {
            return Err(SchemaError::UnknownKeyAttribute {
                attribute: attribute.clone(),
                key: key.join(", "),
                aliases: columns
                    .iter()
                    .map(|c| format!("{} -> {}", c.alias, c.id))
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }

        Ok(Self {
            name,
            columns,
            key,
            by_alias,
        })
    }

    /// Get a column by application attribute name.
    pub fn column(&self, alias: &str) -> Option<&ColumnDefinition> {
        self.by_alias.get(alias).map(|&idx| &self.columns[idx])
    }

    /// Whether `alias` is one of the key attributes.
    pub fn is_key(&self, alias: &str) -> bool {
        self.key.iter().any(|k| k == alias)
    }

    /// Attribute names in declaration order.
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.alias.as_str())
    }

    /// Key column definitions in key order.
    pub fn key_columns(&self) -> Vec<&ColumnDefinition> {
        self.key.iter().filter_map(|k| self.column(k)).collect()
    }
}
