//! In-process query evaluation.
//!
//! Fetched rows are re-filtered with the requesting query after the SQL
//! round-trip, so the SQL `WHERE` clause only has to be a superset filter.
//! Evaluation follows SQL three-valued logic: a comparison involving `null`
//! is unknown, negating unknown stays unknown, and a record matches only
//! when its term evaluates to true.

use crate::expression::{BoolOp, ComparisonOp, Expression, Function, FunctionCall, Operand};
use crate::query::{Condition, Query, Term};
use crate::values::Record;
use serde_json::Value;

/// Three-valued truth: `None` is SQL `UNKNOWN`.
pub type Truth = Option<bool>;

impl Query {
    /// Whether any term matches the record.
    pub fn matches(&self, record: &Record) -> bool {
        self.terms.iter().any(|term| term.matches(record))
    }

    /// Keep the records matching this query, preserving order.
    pub fn filter(&self, records: Vec<Record>) -> Vec<Record> {
        records.into_iter().filter(|r| self.matches(r)).collect()
    }
}

impl Term {
    /// Whether every condition holds for the record.
    pub fn matches(&self, record: &Record) -> bool {
        self.conditions
            .iter()
            .all(|(attribute, condition)| condition.evaluate(record.get(attribute)) == Some(true))
    }
}

impl Condition {
    pub fn evaluate(&self, subject: Option<&Value>) -> Truth {
        match self {
            Condition::Scalar(expected) => {
                Some(subject.is_some_and(|actual| strict_equal(actual, expected)))
            }
            Condition::Expression(expression) => expression.evaluate(subject),
        }
    }
}

impl Expression {
    pub fn evaluate(&self, subject: Option<&Value>) -> Truth {
        match self {
            Expression::Comparison { op, lhs, rhs } => {
                let lhs = lhs.evaluate(subject)?;
                let rhs = rhs.evaluate(subject)?;
                compare(*op, &lhs, &rhs)
            }
            Expression::Combinator {
                op: BoolOp::And,
                operands,
            } => {
                let mut result = Some(true);
                for operand in operands {
                    match operand.evaluate(subject) {
                        Some(false) => return Some(false),
                        None => result = None,
                        Some(true) => {}
                    }
                }
                result
            }
            Expression::Combinator {
                op: BoolOp::Or,
                operands,
            } => {
                let mut result = Some(false);
                for operand in operands {
                    match operand.evaluate(subject) {
                        Some(true) => return Some(true),
                        None => result = None,
                        Some(false) => {}
                    }
                }
                result
            }
            Expression::Not(inner) => inner.evaluate(subject).map(|b| !b),
            Expression::Unsupported(_) => None,
        }
    }
}

impl Operand {
    /// Value of the operand; `None` is SQL `NULL`.
    pub fn evaluate(&self, subject: Option<&Value>) -> Option<Value> {
        match self {
            Operand::Subject => subject.filter(|v| !v.is_null()).cloned(),
            Operand::Scalar(Value::Null) => None,
            Operand::Scalar(value) => Some(value.clone()),
            Operand::Call(call) => call.evaluate(subject),
        }
    }
}

impl FunctionCall {
    pub fn evaluate(&self, subject: Option<&Value>) -> Option<Value> {
        let args = self
            .args
            .iter()
            .map(|a| a.evaluate(subject))
            .collect::<Option<Vec<_>>>()?;

        match self.function {
            Function::Lower => Some(Value::String(args.first()?.as_str()?.to_lowercase())),
            Function::Upper => Some(Value::String(args.first()?.as_str()?.to_uppercase())),
            Function::Length => Some(Value::from(args.first()?.as_str()?.chars().count())),
            Function::Abs => match args.first()? {
                Value::Number(n) if n.is_i64() => n.as_i64()?.checked_abs().map(Value::from),
                Value::Number(n) if n.is_u64() => Some(Value::Number(n.clone())),
                other => number_value(numeric(other)?.abs()),
            },
            Function::Round => {
                let x = numeric(args.first()?)?;
                let digits = i32::try_from(args.get(1)?.as_i64()?).ok()?;
                let scale = 10f64.powi(digits);
                number_value((x * scale).round() / scale)
            }
            Function::Point => {
                let x = numeric(args.first()?)?;
                let y = numeric(args.get(1)?)?;
                Some(Value::String(format!("POINT({x} {y})")))
            }
            Function::Distance => {
                let (ax, ay) = parse_point(args.first()?.as_str()?)?;
                let (bx, by) = parse_point(args.get(1)?.as_str()?)?;
                number_value(((ax - bx).powi(2) + (ay - by).powi(2)).sqrt())
            }
        }
    }
}

/// Strict equality used by scalar conditions: numbers compare by value,
/// everything else must be identical.
pub fn strict_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Compare two non-null values the way MySQL does for the supported types.
///
/// Strings compare bytewise (expressions compile strings as `BINARY`);
/// numbers, booleans and numeric strings compare numerically; anything else
/// is unknown.
pub fn compare(op: ComparisonOp, lhs: &Value, rhs: &Value) -> Truth {
    let ordering = match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => a.as_bytes().cmp(b.as_bytes()),
        _ => numeric(lhs)?.partial_cmp(&numeric(rhs)?)?,
    };
    Some(op.holds(ordering))
}

/// Numeric value, if any. Strings MySQL would not read as a finite number
/// ("inf", "NaN", "1e400") have none.
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|x| x.is_finite()),
        _ => None,
    }
}

fn number_value(x: f64) -> Option<Value> {
    if x.fract() == 0.0 && x.abs() < i64::MAX as f64 {
        Some(Value::from(x as i64))
    } else {
        serde_json::Number::from_f64(x).map(Value::Number)
    }
}

/// Parse a WKT `POINT(x y)`.
fn parse_point(wkt: &str) -> Option<(f64, f64)> {
    let inner = wkt
        .trim()
        .strip_prefix("POINT")?
        .trim()
        .strip_prefix('(')?
        .strip_suffix(')')?;
    let mut coordinates = inner.split_whitespace().map(str::parse::<f64>);
    let x = coordinates.next()?.ok()?;
    let y = coordinates.next()?.ok()?;
    coordinates.next().is_none().then_some((x, y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn query(value: Value) -> Query {
        Query::try_from(value).unwrap()
    }

    #[test]
    fn test_scalar_terms() {
        let q = query(json!([{"name": "Ann"}, {"id": 3}]));
        assert!(q.matches(&record(json!({"id": 1, "name": "Ann"}))));
        assert!(q.matches(&record(json!({"id": 3.0, "name": "Bob"}))));
        assert!(!q.matches(&record(json!({"id": 2, "name": "ann"}))));
        assert!(!q.matches(&record(json!({"id": "3", "name": "Bob"}))));
    }

    #[test]
    fn test_empty_term_matches_everything_and_empty_query_nothing() {
        let r = record(json!({"id": 1}));
        assert!(query(json!([{}])).matches(&r));
        assert!(!query(json!([])).matches(&r));
    }

    #[test]
    fn test_expression_ranges() {
        let q = query(json!([{"age": [">=", 18, "<", 65]}]));
        assert!(q.matches(&record(json!({"age": 18}))));
        assert!(!q.matches(&record(json!({"age": 65}))));
        assert!(!q.matches(&record(json!({"age": null}))));
        assert!(!q.matches(&record(json!({}))));
    }

    #[test]
    fn test_not_of_null_is_unknown() {
        let q = query(json!([{"role": ["==", "admin", "failed"]}]));
        assert!(q.matches(&record(json!({"role": "user"}))));
        assert!(!q.matches(&record(json!({"role": "admin"}))));
        assert!(!q.matches(&record(json!({"role": null}))));
    }

    #[test]
    fn test_or_with_unknown() {
        let q = query(json!([{"x": ["<", 0, "||", "bogus", 1]}]));
        assert!(q.matches(&record(json!({"x": -1}))));
        assert!(!q.matches(&record(json!({"x": 5}))));
    }

    #[test]
    fn test_numeric_string_compares_numerically() {
        assert_eq!(compare(ComparisonOp::Gt, &json!("10"), &json!(9)), Some(true));
        assert_eq!(compare(ComparisonOp::Gt, &json!("10"), &json!("9")), Some(false));
        assert_eq!(compare(ComparisonOp::Eq, &json!([1]), &json!(1)), None);
    }

    #[test]
    fn test_non_finite_strings_are_not_numbers() {
        for s in ["inf", "-Infinity", "NaN", "1e400"] {
            assert_eq!(compare(ComparisonOp::Gt, &json!(s), &json!(1000)), None, "{s}");
        }
        assert!(!query(json!([{"name": [">", 1000]}])).matches(&record(json!({"name": "inf"}))));
        assert_eq!(compare(ComparisonOp::Gt, &json!("1e300"), &json!(1000)), Some(true));
    }

    #[test]
    fn test_functions() {
        let r = record(json!({"name": "Ann", "score": -2.5, "loc": "POINT(3 4)"}));
        assert!(query(json!([{"name": ["lower", "==", "ann"]}])).matches(&r));
        assert!(query(json!([{"name": ["length", "==", 3]}])).matches(&r));
        assert!(query(json!([{"score": ["abs", "==", 2.5]}])).matches(&r));
        assert!(query(json!([{"score": ["round", "==", -3]}])).matches(&r));
        assert!(query(json!([{"score": ["round", 1, "==", -2.5]}])).matches(&r));
        assert!(query(json!([{"loc": ["distance", ["point", 0, 0], "==", 5]}])).matches(&r));
        assert!(!query(json!([{"loc": ["distance", "point", 0, 0, "<", 5]}])).matches(&r));
    }

    #[test]
    fn test_filter_preserves_order() {
        let rows = vec![
            record(json!({"id": 3})),
            record(json!({"id": 1})),
            record(json!({"id": 2})),
        ];
        let kept = query(json!([{"id": [">", 1]}])).filter(rows);
        assert_eq!(kept, vec![record(json!({"id": 3})), record(json!({"id": 2}))]);
    }

    #[test]
    fn test_parse_point() {
        assert_eq!(parse_point("POINT(1.5 -2)"), Some((1.5, -2.0)));
        assert_eq!(parse_point("POINT(1 2 3)"), None);
        assert_eq!(parse_point("LINESTRING(0 0,1 1)"), None);
    }
}
