//! Table binding: a validated table schema with its converters resolved.
//!
//! A binding is built once from the table configuration and a
//! [`ConverterRegistry`], then shared read-only by the writer, the reader
//! and the query compiler. It knows how to turn application values into SQL
//! literals and result rows back into records.

use crate::config::TableConfig;
use crate::driver::ResultSet;
use mysql_types::{
    escape_id, escape_literal, ConversionError, Converter, ConverterRegistry, MySQLValue,
    MySQLValueWithSchema,
};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::Arc;
use sync_core::{ColumnDefinition, ColumnSpec, Record, SchemaError, TableSchema};

/// Error type for binding construction.
#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("Unknown converter '{converter}' for column '{column}'")]
    UnknownConverter { column: String, converter: String },
}

/// Column with its escaped name and resolved converter.
#[derive(Clone)]
pub struct BoundColumn {
    pub definition: ColumnDefinition,
    /// Escaped storage column name
    pub escaped_id: String,
    pub converter: Option<Arc<dyn Converter>>,
}

impl BoundColumn {
    pub fn alias(&self) -> &str {
        &self.definition.alias
    }

    /// SQL literal for an application value of this column.
    ///
    /// `null` never reaches the converter.
    pub fn literal(&self, value: &JsonValue) -> Result<String, ConversionError> {
        if value.is_null() {
            return Ok("NULL".to_string());
        }
        match &self.converter {
            Some(converter) => {
                let stored = converter.parse(value)?;
                Ok(converter.wrap_literal(escape_literal(&stored)))
            }
            None => Ok(escape_literal(MySQLValue::from(value).as_inner())),
        }
    }

    /// SELECT list item, aliased when the attribute name differs from the column.
    pub fn select_item(&self) -> String {
        let expression = self
            .converter
            .as_ref()
            .and_then(|c| c.select_expression(&self.escaped_id));

        match (expression, self.definition.is_aliased()) {
            (Some(expression), _) => format!("{expression} AS {}", escape_id(self.alias())),
            (None, true) => format!("{} AS {}", self.escaped_id, escape_id(self.alias())),
            (None, false) => self.escaped_id.clone(),
        }
    }

    /// Application value of a stored value.
    pub fn read(&self, value: MySQLValueWithSchema) -> Result<JsonValue, ConversionError> {
        if matches!(value.value, mysql_async::Value::NULL) {
            return Ok(JsonValue::Null);
        }
        match &self.converter {
            Some(converter) => converter.serialize(value),
            None => value.to_json(),
        }
    }
}

impl fmt::Debug for BoundColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundColumn")
            .field("id", &self.definition.id)
            .field("alias", &self.definition.alias)
            .field("converter", &self.definition.converter)
            .finish()
    }
}

/// Immutable table binding.
#[derive(Debug, Clone)]
pub struct TableBinding {
    schema: TableSchema,
    escaped_table: String,
    columns: Vec<BoundColumn>,
}

impl TableBinding {
    /// Bind `columns` of `table`, rejecting keys that are not declared
    /// columns and converters missing from `registry`.
    pub fn new(
        table: &str,
        columns: impl IntoIterator<Item = ColumnSpec>,
        key: Vec<String>,
        registry: &ConverterRegistry,
    ) -> Result<Self, BindingError> {
        let schema = TableSchema::new(table, columns, key)?;

        let columns = schema
            .columns
            .iter()
            .map(|definition| {
                let converter = match &definition.converter {
                    Some(name) => Some(registry.get(name).ok_or_else(|| {
                        BindingError::UnknownConverter {
                            column: definition.id.clone(),
                            converter: name.clone(),
                        }
                    })?),
                    None => None,
                };
                Ok(BoundColumn {
                    definition: definition.clone(),
                    escaped_id: escape_id(&definition.id),
                    converter,
                })
            })
            .collect::<Result<Vec<_>, BindingError>>()?;

        Ok(Self {
            escaped_table: escape_id(&schema.name),
            schema,
            columns,
        })
    }

    pub fn from_config(
        config: &TableConfig,
        registry: &ConverterRegistry,
    ) -> Result<Self, BindingError> {
        Self::new(
            &config.name,
            config.columns.iter().cloned(),
            config.key.clone(),
            registry,
        )
    }

    /// Unescaped table name.
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    /// Escaped table name.
    pub fn table(&self) -> &str {
        &self.escaped_table
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Columns in declaration order.
    pub fn columns(&self) -> &[BoundColumn] {
        &self.columns
    }

    /// Column bound to application attribute `alias`.
    pub fn column(&self, alias: &str) -> Option<&BoundColumn> {
        self.columns.iter().find(|c| c.alias() == alias)
    }

    /// Key attributes.
    pub fn key(&self) -> &[String] {
        &self.schema.key
    }

    /// Key columns in key order.
    pub fn key_columns(&self) -> Vec<&BoundColumn> {
        self.schema
            .key
            .iter()
            .filter_map(|k| self.column(k))
            .collect()
    }

    /// SELECT list in declaration order.
    pub fn select_list(&self) -> String {
        self.columns
            .iter()
            .map(BoundColumn::select_item)
            .collect::<Vec<_>>()
            .join("\n       , ")
    }

    /// Records of a result set selected with [`Self::select_list`].
    pub fn records(&self, result: ResultSet) -> Result<Vec<Record>, ConversionError> {
        let ResultSet { columns, rows } = result;

        rows.into_iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row)
                    .enumerate()
                    .map(|(i, (column, value))| {
                        let value = match columns.get(i) {
                            Some(meta) => MySQLValueWithSchema::new(value, meta.column_type, meta.flags),
                            None => MySQLValueWithSchema::new(
                                value,
                                mysql_async::consts::ColumnType::MYSQL_TYPE_VAR_STRING,
                                mysql_async::consts::ColumnFlags::empty(),
                            ),
                        };
                        Ok((column.alias().to_string(), column.read(value)?))
                    })
                    .collect::<Result<Record, ConversionError>>()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ColumnMeta;
    use mysql_async::consts::{ColumnFlags, ColumnType};
    use mysql_async::Value;
    use crate::testing::users_binding as users;
    use serde_json::json;

    #[test]
    fn test_binding_resolves_columns() {
        let binding = users();
        assert_eq!(binding.table(), "`users`");
        assert_eq!(binding.name(), "users");
        assert_eq!(binding.key(), ["id".to_string()]);
        assert_eq!(binding.column("createdAt").unwrap().escaped_id, "`created_at`");
        assert!(binding.column("created_at").is_none());
        assert!(binding.column("createdAt").unwrap().converter.is_some());
    }

    #[test]
    fn test_unknown_converter_rejected() {
        let columns = vec![ColumnSpec::Detailed {
            id: "id".into(),
            alias: None,
            converter: Some("rot13".into()),
        }];
        let err = TableBinding::new("t", columns, vec!["id".into()], &ConverterRegistry::default())
            .unwrap_err();
        assert!(matches!(err, BindingError::UnknownConverter { ref converter, .. } if converter == "rot13"));
    }

    #[test]
    fn test_key_must_be_declared() {
        let err = TableBinding::new(
            "t",
            vec![ColumnSpec::from("name")],
            vec!["id".into()],
            &ConverterRegistry::default(),
        )
        .unwrap_err();
        assert!(matches!(err, BindingError::Schema(SchemaError::UnknownKeyAttribute { .. })));
    }

    #[test]
    fn test_literals() {
        let binding = users();
        let created = binding.column("createdAt").unwrap();
        assert_eq!(
            created.literal(&json!(1_700_000_000_000i64)).unwrap(),
            "'2023-11-14 22:13:20.000'"
        );
        assert_eq!(created.literal(&JsonValue::Null).unwrap(), "NULL");

        let name = binding.column("name").unwrap();
        assert_eq!(name.literal(&json!("O'Brien")).unwrap(), "'O\\'Brien'");
        assert_eq!(binding.column("id").unwrap().literal(&json!(1)).unwrap(), "1");
    }

    #[test]
    fn test_select_list() {
        assert_eq!(
            users().select_list(),
            "`id`\n       , `name`\n       , `created_at` AS `createdAt`"
        );

        let columns = vec![ColumnSpec::from("id"), ColumnSpec::Detailed {
            id: "loc".into(),
            alias: Some("location".into()),
            converter: Some("geometry_wkt".into()),
        }];
        let binding =
            TableBinding::new("places", columns, vec!["id".into()], &ConverterRegistry::default())
                .unwrap();
        assert_eq!(
            binding.select_list(),
            "`id`\n       , ST_AsText(`loc`) AS `location`"
        );
    }

    #[test]
    fn test_records_from_text_protocol() {
        let result = ResultSet {
            columns: vec![
                ColumnMeta::new("id", ColumnType::MYSQL_TYPE_LONG),
                ColumnMeta::new("name", ColumnType::MYSQL_TYPE_VAR_STRING),
                ColumnMeta::new("createdAt", ColumnType::MYSQL_TYPE_DATETIME)
                    .with_flags(ColumnFlags::BINARY_FLAG),
            ],
            rows: vec![
                vec![
                    Value::Bytes(b"1".to_vec()),
                    Value::Bytes(b"Ann".to_vec()),
                    Value::Bytes(b"2023-11-14 22:13:20.000".to_vec()),
                ],
                vec![Value::Bytes(b"2".to_vec()), Value::NULL, Value::NULL],
            ],
        };

        let records = users().records(result).unwrap();
        assert_eq!(
            JsonValue::Object(records[0].clone()),
            json!({"id": 1, "name": "Ann", "createdAt": 1_700_000_000_000i64})
        );
        assert_eq!(
            JsonValue::Object(records[1].clone()),
            json!({"id": 2, "name": null, "createdAt": null})
        );
    }
}
