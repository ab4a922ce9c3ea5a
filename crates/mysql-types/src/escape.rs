//! SQL escaping for identifiers and literals.

use mysql_async::Value;

/// Quote an identifier with backticks.
///
/// Dots separate qualified names (`db.table` becomes `` `db`.`table` ``) and
/// embedded backticks are doubled.
pub fn escape_id(id: &str) -> String {
    id.split('.')
        .map(|part| format!("`{}`", part.replace('`', "``")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Render a value as an SQL literal.
pub fn escape_literal(value: &Value) -> String {
    value.as_sql(false)
}

/// Render a value as a literal compared bytewise.
///
/// Strings get a `BINARY` prefix so comparisons ignore the column collation.
pub fn escape_binary_literal(value: &Value) -> String {
    match value {
        Value::Bytes(_) => format!("BINARY {}", escape_literal(value)),
        _ => escape_literal(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_id() {
        assert_eq!(escape_id("users"), "`users`");
        assert_eq!(escape_id("app.users"), "`app`.`users`");
        assert_eq!(escape_id("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_escape_literal() {
        assert_eq!(escape_literal(&Value::NULL), "NULL");
        assert_eq!(escape_literal(&Value::Int(1)), "1");
        assert_eq!(escape_literal(&Value::Bytes(b"Ann".to_vec())), "'Ann'");
        assert_eq!(escape_literal(&Value::Bytes(b"O'Hara".to_vec())), "'O\\'Hara'");
    }

    #[test]
    fn test_escape_binary_literal() {
        assert_eq!(
            escape_binary_literal(&Value::Bytes(b"Ann".to_vec())),
            "BINARY 'Ann'"
        );
        assert_eq!(escape_binary_literal(&Value::Int(3)), "3");
    }
}
