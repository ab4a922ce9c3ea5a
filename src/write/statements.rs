//! INSERT, DELETE and UPDATE statements of a batch.
//!
//! Builders validate the whole batch before producing any SQL: a value with a
//! missing key attribute, or an attribute its converter rejects, produces a
//! [`Rejection`] and no statement at all.

use crate::binding::{BoundColumn, TableBinding};
use serde_json::Value;
use sync_core::{attribute, Record, Update};

/// Why a batch was refused before reaching the database.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// Key attribute missing or null
    NullKey { position: usize, attribute: String },
    /// Converter failure
    InvalidValue {
        position: usize,
        attribute: String,
        message: String,
    },
}

impl Rejection {
    pub fn position(&self) -> usize {
        match self {
            Rejection::NullKey { position, .. } | Rejection::InvalidValue { position, .. } => {
                *position
            }
        }
    }
}

fn literal(
    column: &BoundColumn,
    value: &Value,
    position: usize,
) -> Result<String, Rejection> {
    column.literal(value).map_err(|e| Rejection::InvalidValue {
        position,
        attribute: column.alias().to_string(),
        message: e.to_string(),
    })
}

fn key_value<'a>(
    column: &BoundColumn,
    record: &'a Record,
    position: usize,
) -> Result<&'a Value, Rejection> {
    attribute(record, column.alias()).ok_or_else(|| Rejection::NullKey {
        position,
        attribute: column.alias().to_string(),
    })
}

/// `` `a` = 1 AND `b` = 2 `` for the key of `record`.
fn key_condition(
    binding: &TableBinding,
    record: &Record,
    position: usize,
) -> Result<String, Rejection> {
    binding
        .key_columns()
        .into_iter()
        .map(|column| {
            let value = key_value(column, record, position)?;
            Ok(format!("{} = {}", column.escaped_id, literal(column, value, position)?))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(|conditions| conditions.join(" AND "))
}

// ============================================================================
// INSERT
// ============================================================================

/// Multi-row INSERT of `values`, with the values to confirm downstream.
///
/// Confirmed values hold exactly the declared attributes, `null` for the
/// missing ones, so that reading the rows back reproduces them.
pub fn insert(binding: &TableBinding, values: &[Record]) -> Result<(String, Vec<Record>), Rejection> {
    let mut emit_values = Vec::with_capacity(values.len());
    let mut rows = Vec::with_capacity(values.len());

    for (position, value) in values.iter().enumerate() {
        let mut emit_value = Record::new();
        let mut literals = Vec::with_capacity(binding.columns().len());

        for column in binding.columns() {
            let v = match attribute(value, column.alias()) {
                Some(v) => v.clone(),
                None if binding.schema().is_key(column.alias()) => {
                    return Err(Rejection::NullKey {
                        position,
                        attribute: column.alias().to_string(),
                    })
                }
                None => Value::Null,
            };
            literals.push(literal(column, &v, position)?);
            emit_value.insert(column.alias().to_string(), v);
        }

        rows.push(format!("( {} )", literals.join(", ")));
        emit_values.push(emit_value);
    }

    let columns = binding
        .columns()
        .iter()
        .map(|c| c.escaped_id.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    let sql = format!(
        "INSERT {}\n\n    ( {} )\n\n  VALUES\n\n    {}",
        binding.table(),
        columns,
        rows.join(",\n    ")
    );

    Ok((sql, emit_values))
}

// ============================================================================
// DELETE
// ============================================================================

/// DELETE of the rows keyed like `values`.
///
/// A single-column key gives `` WHERE `id` IN ( ... ) ``, a composite key an
/// OR of per-row equality groups.
pub fn delete(binding: &TableBinding, values: &[Record]) -> Result<String, Rejection> {
    let key = binding.key_columns();

    let condition = match key.as_slice() {
        [column] => {
            let literals = values
                .iter()
                .enumerate()
                .map(|(position, value)| {
                    literal(column, key_value(column, value, position)?, position)
                })
                .collect::<Result<Vec<_>, _>>()?;
            format!("{} IN ( {} )", column.escaped_id, literals.join(", "))
        }
        _ => values
            .iter()
            .enumerate()
            .map(|(position, value)| {
                key_condition(binding, value, position).map(|c| format!("( {c} )"))
            })
            .collect::<Result<Vec<_>, _>>()?
            .join("\n     OR "),
    };

    Ok(format!("DELETE FROM {}\n\n  WHERE {}", binding.table(), condition))
}

// ============================================================================
// UPDATE
// ============================================================================

/// UPDATE of one row of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RowUpdate {
    /// Index of the update in its batch
    pub position: usize,
    pub sql: String,
}

/// Per-row UPDATE statements of a batch.
///
/// Only changed attributes are set and rows are matched on the key of their
/// old state. Updates that change nothing get no statement. Every key, old
/// and new, is checked before any statement is returned.
pub fn update(binding: &TableBinding, updates: &[Update]) -> Result<Vec<RowUpdate>, Rejection> {
    for (position, u) in updates.iter().enumerate() {
        for column in binding.key_columns() {
            key_value(column, &u.old, position)?;
            key_value(column, &u.new, position)?;
        }
    }

    let mut statements = Vec::new();

    for (position, u) in updates.iter().enumerate() {
        let changed = u.changed(binding.columns().iter().map(BoundColumn::alias));
        if changed.is_empty() {
            continue;
        }

        let assignments = changed
            .into_iter()
            .filter_map(|alias| binding.column(alias))
            .map(|column| {
                let value = u.new.get(column.alias()).cloned().unwrap_or(Value::Null);
                Ok(format!("{} = {}", column.escaped_id, literal(column, &value, position)?))
            })
            .collect::<Result<Vec<_>, Rejection>>()?;

        statements.push(RowUpdate {
            position,
            sql: format!(
                "UPDATE {}\n\n  SET {}\n\n  WHERE {}",
                binding.table(),
                assignments.join(", "),
                key_condition(binding, &u.old, position)?
            ),
        });
    }

    Ok(statements)
}
