//! Query compiler: [`Query`] → SQL `WHERE` clause.
//!
//! The generated clause is a *superset* filter. Whatever cannot be expressed
//! faithfully in SQL is left out, which can only let more rows through; the
//! reader then re-applies the query in-process so delivered rows are exact.
//!
//! Rules:
//!
//! - scalar condition: `` `column` = literal ``, the literal passing through
//!   the column's converter
//! - unknown attribute, `flow: "error"`, or a literal that cannot be
//!   converted: the condition is dropped, weakening its term
//! - a term whose conditions are all dropped matches everything, so the
//!   whole clause is dropped
//! - expressions compile to an [`Compiled`] fragment that is either *exact*
//!   or *weakened*; `NOT` is only applied to exact fragments

use crate::binding::{BoundColumn, TableBinding};
use mysql_types::{escape_binary_literal, Comparability, MySQLValue};
use serde_json::Value as JsonValue;
use sync_core::{
    BoolOp, ComparisonOp, Condition, Expression, Function, FunctionCall, Operand, Query, Term,
};
use tracing::debug;

/// SQL fragment of an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compiled {
    pub sql: String,
    /// Whether the fragment holds for exactly the values the expression accepts
    pub exact: bool,
    /// Whether the fragment needs parentheses when embedded
    compound: bool,
}

impl Compiled {
    fn atom(sql: String) -> Self {
        Self {
            sql,
            exact: true,
            compound: false,
        }
    }

    /// SQL safe to embed next to other conditions.
    pub fn grouped(&self) -> String {
        if self.compound {
            format!("( {} )", self.sql)
        } else {
            self.sql.clone()
        }
    }
}

/// `WHERE` clause for `query`, or an empty string when nothing can be filtered.
pub fn where_clause(query: &Query, binding: &TableBinding) -> String {
    let mut terms = Vec::with_capacity(query.terms.len());

    for term in &query.terms {
        match compile_term(term, binding) {
            Some(sql) => terms.push(sql),
            None => {
                debug!("Query term {:?} compiles to no condition, fetching all rows", term);
                return String::new();
            }
        }
    }

    if terms.is_empty() {
        return String::new();
    }

    format!("\n\n  WHERE ( {} )", terms.join(" )\n     OR ( "))
}

/// Conjunction of the compilable conditions of `term`, `None` if there are none.
pub fn compile_term(term: &Term, binding: &TableBinding) -> Option<String> {
    let clauses: Vec<String> = term
        .conditions
        .iter()
        .filter_map(|(attribute, condition)| compile_condition(attribute, condition, binding))
        .collect();

    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" AND "))
    }
}

fn compile_condition(
    attribute: &str,
    condition: &Condition,
    binding: &TableBinding,
) -> Option<String> {
    if attribute == sync_core::values::FLOW_ATTRIBUTE
        && matches!(condition, Condition::Scalar(JsonValue::String(s)) if s == "error")
    {
        return None;
    }

    let Some(column) = binding.column(attribute) else {
        debug!("Query attribute '{}' has no column, condition dropped", attribute);
        return None;
    };

    match condition {
        Condition::Scalar(value @ (JsonValue::Number(_) | JsonValue::String(_))) => {
            if !allows(column, ComparisonOp::Eq) || !is_application_value(column, value) {
                debug!("Condition on '{}' cannot be compared in SQL, condition dropped", attribute);
                return None;
            }
            match column.literal(value) {
                Ok(literal) => Some(format!("{} = {}", column.escaped_id, literal)),
                Err(e) => {
                    debug!("Query value for '{}' not convertible ({}), condition dropped", attribute, e);
                    None
                }
            }
        }
        Condition::Scalar(_) => None,
        Condition::Expression(expression) => {
            compile_expression(expression, column).map(|c| c.grouped())
        }
    }
}

/// Compile an expression applied to `column`.
pub fn compile_expression(expression: &Expression, column: &BoundColumn) -> Option<Compiled> {
    match expression {
        Expression::Comparison { op, lhs, rhs } => {
            let (lhs, rhs) = match (lhs, rhs) {
                (Operand::Subject, Operand::Scalar(value)) => {
                    (column.escaped_id.clone(), subject_literal(column, *op, value)?)
                }
                (Operand::Scalar(value), Operand::Subject) => {
                    (subject_literal(column, *op, value)?, column.escaped_id.clone())
                }
                (lhs, rhs) => (compile_operand(lhs, column)?, compile_operand(rhs, column)?),
            };
            Some(Compiled::atom(format!("{lhs} {} {rhs}", op.sql())))
        }

        Expression::Combinator { op, operands } => {
            let compiled: Vec<Option<Compiled>> = operands
                .iter()
                .map(|e| compile_expression(e, column))
                .collect();

            let parts: Vec<Compiled> = match op {
                // Dropping a conjunct only widens the filter.
                BoolOp::And => compiled.iter().flatten().cloned().collect(),
                // A dropped disjunct would narrow it.
                BoolOp::Or => compiled.iter().cloned().collect::<Option<Vec<_>>>()?,
            };

            let exact = parts.len() == operands.len() && parts.iter().all(|p| p.exact);
            match parts.len() {
                0 => None,
                1 => parts.into_iter().next().map(|part| Compiled {
                    exact,
                    ..part
                }),
                _ => Some(Compiled {
                    sql: parts
                        .iter()
                        .map(|p| format!("( {} )", p.sql))
                        .collect::<Vec<_>>()
                        .join(&format!(" {} ", op.sql())),
                    exact,
                    compound: true,
                }),
            }
        }

        Expression::Not(inner) => {
            let inner = compile_expression(inner, column)?;
            if !inner.exact {
                return None;
            }
            Some(Compiled::atom(format!("NOT ( {} )", inner.sql)))
        }

        Expression::Unsupported(reason) => {
            debug!("Expression not translated to SQL: {}", reason);
            None
        }
    }
}

/// Literal compared directly with the stored column value.
fn subject_literal(column: &BoundColumn, op: ComparisonOp, value: &JsonValue) -> Option<String> {
    if column.converter.is_none() {
        return scalar_literal(value);
    }
    if !allows(column, op) || value.is_null() || value.is_array() || value.is_object() {
        return None;
    }
    if !is_application_value(column, value) {
        debug!("Operand {} is not an application value of '{}', dropped", value, column.alias());
        return None;
    }
    column.literal(value).ok()
}

fn is_application_value(column: &BoundColumn, value: &JsonValue) -> bool {
    column
        .converter
        .as_ref()
        .map_or(true, |c| c.is_application_value(value))
}

/// Whether `op` on the stored value of `column` agrees with `op` on the
/// application value.
fn allows(column: &BoundColumn, op: ComparisonOp) -> bool {
    match column.converter.as_ref().map(|c| c.comparability()) {
        None | Some(Comparability::Ordered) => true,
        Some(Comparability::Equality) => op == ComparisonOp::Eq,
        Some(Comparability::Opaque) => false,
    }
}

/// Literal compared bytewise for strings, as the in-process evaluator does.
///
/// `NULL` is never equal to anything in SQL, so null literals are not compiled.
fn scalar_literal(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => None,
        value => Some(escape_binary_literal(MySQLValue::from(value).as_inner())),
    }
}

fn compile_operand(operand: &Operand, column: &BoundColumn) -> Option<String> {
    match operand {
        Operand::Subject if column.converter.is_none() => Some(column.escaped_id.clone()),
        // Converted values only make sense to SQL functions in storage form.
        Operand::Subject => None,
        Operand::Scalar(value) => scalar_literal(value),
        Operand::Call(call) => compile_call(call, column),
    }
}

fn compile_call(call: &FunctionCall, column: &BoundColumn) -> Option<String> {
    let args = match call.function {
        Function::Point => call
            .args
            .iter()
            .map(|arg| match arg {
                Operand::Scalar(JsonValue::Number(n)) => Some(n.to_string()),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?,

        // MySQL rounds DOUBLE half-to-even and DECIMAL exactly; neither
        // matches the in-process result on ties.
        Function::Round => {
            debug!("ROUND has no exact SQL counterpart, dropped");
            return None;
        }

        // Spatial functions read the stored geometry, not its text form.
        Function::Distance => {
            let geometry = match call.args.first()? {
                Operand::Subject if column.converter.as_ref().is_some_and(|c| {
                    c.select_expression(&column.escaped_id).is_some()
                }) =>
                {
                    column.escaped_id.clone()
                }
                other => compile_operand(other, column)?,
            };
            let other = match call.args.get(1)? {
                Operand::Call(point @ FunctionCall {
                    function: Function::Point,
                    ..
                }) => compile_call(point, column)?,
                _ => return None,
            };
            vec![geometry, other]
        }

        Function::Lower | Function::Upper | Function::Length | Function::Abs => call
            .args
            .iter()
            .map(|arg| compile_operand(arg, column))
            .collect::<Option<Vec<_>>>()?,
    };

    Some(format!("{}({})", call.function.sql(), args.join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::users_binding;
    use mysql_types::ConverterRegistry;
    use serde_json::json;
    use sync_core::ColumnSpec;

    fn compile(query: JsonValue) -> String {
        let query = Query::try_from(query).unwrap();
        where_clause(&query, &users_binding())
    }

    fn places() -> TableBinding {
        TableBinding::new(
            "places",
            vec![
                ColumnSpec::from("id"),
                ColumnSpec::Detailed {
                    id: "loc".into(),
                    alias: Some("location".into()),
                    converter: Some("geometry_wkt".into()),
                },
            ],
            vec!["id".into()],
            &ConverterRegistry::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_scalar_term() {
        assert_eq!(compile(json!([{"name": "Ann"}])), "\n\n  WHERE ( `name` = 'Ann' )");
    }

    #[test]
    fn test_terms_or_conditions_and() {
        assert_eq!(
            compile(json!([{"id": 1, "name": "Ann"}, {"id": 2}])),
            "\n\n  WHERE ( `id` = 1 AND `name` = 'Ann' )\n     OR ( `id` = 2 )"
        );
    }

    #[test]
    fn test_empty_query_has_no_where() {
        assert_eq!(compile(json!([])), "");
    }

    #[test]
    fn test_unknown_attribute_weakens_term() {
        assert_eq!(
            compile(json!([{"id": 1, "nickname": "A"}])),
            "\n\n  WHERE ( `id` = 1 )"
        );
    }

    #[test]
    fn test_fully_dropped_term_matches_everything() {
        assert_eq!(compile(json!([{"id": 1}, {"nickname": "A"}])), "");
        assert_eq!(compile(json!([{"flow": "error"}])), "");
    }

    #[test]
    fn test_scalar_passes_through_converter() {
        assert_eq!(
            compile(json!([{"createdAt": 1_700_000_000_000i64}])),
            "\n\n  WHERE ( `created_at` = '2023-11-14 22:13:20.000' )"
        );
    }

    #[test]
    fn test_non_scalar_condition_dropped() {
        assert_eq!(compile(json!([{"id": 1, "name": null}])), "\n\n  WHERE ( `id` = 1 )");
        assert_eq!(compile(json!([{"id": 1, "name": true}])), "\n\n  WHERE ( `id` = 1 )");
    }

    #[test]
    fn test_comparison_expressions() {
        assert_eq!(
            compile(json!([{"id": [">=", 18, "<", 65]}])),
            "\n\n  WHERE ( ( `id` >= 18 ) AND ( `id` < 65 ) )"
        );
        assert_eq!(
            compile(json!([{"name": ["==", "Ann"]}])),
            "\n\n  WHERE ( `name` = BINARY 'Ann' )"
        );
        assert_eq!(
            compile(json!([{"createdAt": [">", 1_700_000_000_000i64]}])),
            "\n\n  WHERE ( `created_at` > '2023-11-14 22:13:20.000' )"
        );
    }

    #[test]
    fn test_or_and_not() {
        assert_eq!(
            compile(json!([{"id": ["<", 0, "||", ">", 100]}])),
            "\n\n  WHERE ( ( `id` < 0 ) OR ( `id` > 100 ) )"
        );
        assert_eq!(
            compile(json!([{"name": ["==", "admin", "failed"]}])),
            "\n\n  WHERE ( NOT ( `name` = BINARY 'admin' ) )"
        );
    }

    #[test]
    fn test_expression_combined_with_scalar() {
        assert_eq!(
            compile(json!([{"id": ["<", 0, "||", ">", 100], "name": "Ann"}])),
            "\n\n  WHERE ( ( ( `id` < 0 ) OR ( `id` > 100 ) ) AND `name` = 'Ann' )"
        );
    }

    #[test]
    fn test_functions() {
        assert_eq!(
            compile(json!([{"name": ["lower", "==", "ann"]}])),
            "\n\n  WHERE ( LOWER(`name`) = BINARY 'ann' )"
        );
    }

    #[test]
    fn test_round_is_never_compiled() {
        assert_eq!(compile(json!([{"id": ["round", "==", 3]}])), "");
        assert_eq!(
            compile(json!([{"id": 1, "name": ["round", 2, "==", 1]}])),
            "\n\n  WHERE ( `id` = 1 )"
        );
        // Dropped inside an OR, the whole OR goes.
        assert_eq!(compile(json!([{"id": ["round", "==", 3, "||", ">", 10]}])), "");
    }

    #[test]
    fn test_converted_operand_must_be_application_value() {
        assert_eq!(compile(json!([{"createdAt": ["==", "1700000000000"]}])), "");
        assert_eq!(
            compile(json!([{"id": 1, "createdAt": [">", "2023-11-14 22:13:20.000"]}])),
            "\n\n  WHERE ( `id` = 1 )"
        );
        assert_eq!(compile(json!([{"id": 1, "createdAt": "1700000000000"}])), "\n\n  WHERE ( `id` = 1 )");
    }

    #[test]
    fn test_distance_uses_stored_geometry() {
        let query = Query::try_from(json!([{"location": ["distance", ["point", 2, 3], "<", 10]}]))
            .unwrap();
        assert_eq!(
            where_clause(&query, &places()),
            "\n\n  WHERE ( ST_Distance(`loc`, POINT(2, 3)) < 10 )"
        );
    }

    #[test]
    fn test_opaque_converter_comparison_dropped() {
        let query = Query::try_from(json!([{"id": 1, "location": "POINT(1 2)"}])).unwrap();
        assert_eq!(where_clause(&query, &places()), "\n\n  WHERE ( `id` = 1 )");
    }

    #[test]
    fn test_null_comparison_dropped() {
        assert_eq!(compile(json!([{"id": 1, "name": ["==", null]}])), "\n\n  WHERE ( `id` = 1 )");
    }

    #[test]
    fn test_unsupported_expression_dropped() {
        assert_eq!(compile(json!([{"id": 1, "name": ["~=", "A"]}])), "\n\n  WHERE ( `id` = 1 )");
        assert_eq!(compile(json!([{"name": ["~=", "A"]}])), "");
    }

    #[test]
    fn test_weakened_or_is_dropped() {
        // The right side of || is unsupported: the whole OR must go.
        assert_eq!(
            compile(json!([{"id": 1, "name": ["==", "A", "||", "~=", "B"]}])),
            "\n\n  WHERE ( `id` = 1 )"
        );
    }

    #[test]
    fn test_not_over_weakened_is_dropped() {
        // AND keeps its supported half, but NOT over it would exclude matches.
        assert_eq!(
            compile(json!([{"id": 1, "name": [["~=", "B"], "==", "A", "failed"]}])),
            "\n\n  WHERE ( `id` = 1 )"
        );
    }
}
