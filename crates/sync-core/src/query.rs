//! Query objects.
//!
//! A query is a disjunction of terms; each term is a conjunction of
//! per-attribute conditions. A condition is either a scalar, meaning strict
//! equality, or an expression (see [`crate::expression`]):
//!
//! ```json
//! [ { "name": "Ann" }, { "age": [ ">=", 18 ], "country": "FR" } ]
//! ```

use crate::expression::Expression;
use serde::Deserialize;
use serde_json::Value;

/// Error type for query parsing.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Query must be an array of terms, got: {0}")]
    NotAnArray(Value),

    #[error("Query term at position {position} must be an object, got: {value}")]
    TermNotObject { position: usize, value: Value },
}

/// Condition on one attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Strict equality with a scalar value
    Scalar(Value),
    /// Parsed expression
    Expression(Expression),
}

impl From<Value> for Condition {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(tokens) => Condition::Expression(Expression::parse(&tokens)),
            other => Condition::Scalar(other),
        }
    }
}

/// One OR-term: every condition must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Term {
    pub conditions: Vec<(String, Condition)>,
}

impl Term {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a condition on `attribute`.
    pub fn with(mut self, attribute: impl Into<String>, condition: impl Into<Condition>) -> Self {
        self.conditions.push((attribute.into(), condition.into()));
        self
    }
}

/// Disjunction of terms.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub struct Query {
    pub terms: Vec<Term>,
}

impl Query {
    pub fn new(terms: Vec<Term>) -> Self {
        Self { terms }
    }

    /// Query matching records whose `attribute` equals `value`.
    pub fn equals(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(vec![Term::new().with(attribute, Condition::Scalar(value.into()))])
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

impl TryFrom<Value> for Query {
    type Error = QueryError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Array(terms) = value else {
            return Err(QueryError::NotAnArray(value));
        };

        terms
            .into_iter()
            .enumerate()
            .map(|(position, term)| match term {
                Value::Object(map) => Ok(Term {
                    conditions: map.into_iter().map(|(k, v)| (k, v.into())).collect(),
                }),
                value => Err(QueryError::TermNotObject { position, value }),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Query::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::ComparisonOp;
    use serde_json::json;

    #[test]
    fn test_query_from_json() {
        let query: Query =
            serde_json::from_value(json!([{"name": "Ann"}, {"age": [">=", 18]}])).unwrap();
        assert_eq!(query.terms.len(), 2);
        assert_eq!(
            query.terms[0].conditions,
            vec![("name".to_string(), Condition::Scalar(json!("Ann")))]
        );
        assert!(matches!(
            &query.terms[1].conditions[0].1,
            Condition::Expression(Expression::Comparison { op: ComparisonOp::Ge, .. })
        ));
    }

    #[test]
    fn test_query_rejects_non_array() {
        let err = Query::try_from(json!({"name": "Ann"})).unwrap_err();
        assert!(matches!(err, QueryError::NotAnArray(_)));
    }

    #[test]
    fn test_query_rejects_non_object_term() {
        let err = Query::try_from(json!([{"a": 1}, 3])).unwrap_err();
        assert!(matches!(err, QueryError::TermNotObject { position: 1, .. }));
    }

    #[test]
    fn test_equals_builder() {
        let query = Query::equals("id", 1);
        assert_eq!(query, Query::try_from(json!([{"id": 1}])).unwrap());
    }
}
