//! Query compilation and in-process filtering
//!
//! The fake driver ignores the WHERE clause and returns the whole table, the
//! widest result a compiled filter could ever let through. Delivered rows
//! must still be exactly the rows the query matches.

use mysql_async::consts::{ColumnFlags, ColumnType};
use mysql_async::Value as MySqlValue;
use mysql_table_sync::config::{ConnectionOptions, ReconnectPolicy};
use mysql_table_sync::driver::ColumnMeta;
use mysql_table_sync::testing::{users_binding, FakeDriver};
use mysql_table_sync::where_clause::where_clause;
use mysql_table_sync::{ConnectionManager, ResultSet, TableSync};
use serde_json::{json, Value};
use std::sync::Arc;
use sync_core::{Query, Record};

const USERS: &[(i64, Option<&str>, Option<&str>)] = &[
    (1, Some("Ann"), Some("2023-11-14 22:13:20.000")),
    (2, Some("ann"), None),
    (3, Some("Bob"), Some("2024-01-01 00:00:00.000")),
    (4, None, None),
    (5, Some("Zoë"), Some("2020-02-29 12:00:00.500")),
    (6, Some("inf"), None),
];

fn table() -> ResultSet {
    ResultSet {
        columns: vec![
            ColumnMeta::new("id", ColumnType::MYSQL_TYPE_LONG),
            ColumnMeta::new("name", ColumnType::MYSQL_TYPE_VAR_STRING),
            ColumnMeta::new("createdAt", ColumnType::MYSQL_TYPE_DATETIME)
                .with_flags(ColumnFlags::BINARY_FLAG),
        ],
        rows: USERS
            .iter()
            .map(|(id, name, created)| {
                let text = |v: &Option<&str>| match v {
                    Some(s) => MySqlValue::Bytes(s.as_bytes().to_vec()),
                    None => MySqlValue::NULL,
                };
                vec![MySqlValue::Int(*id), text(name), text(created)]
            })
            .collect(),
    }
}

fn query(value: Value) -> Query {
    Query::try_from(value).unwrap()
}

async fn fetch_from_full_table(q: &Query) -> (Vec<Record>, Vec<Record>) {
    let driver = FakeDriver::new();
    let manager = ConnectionManager::new(
        Arc::new(driver.clone()),
        ConnectionOptions::default(),
        ReconnectPolicy::default(),
    );
    manager.add("root", ConnectionOptions::default()).await;
    let (sync, _emissions) = TableSync::new(users_binding(), manager, 4);

    // every row, unfiltered
    driver.push_result(table());
    let all = sync.fetch_all(None).await.unwrap();

    driver.push_result(table());
    let delivered = sync.fetch_all(Some(q.clone())).await.unwrap();

    (all, delivered)
}

#[tokio::test]
async fn test_delivered_rows_equal_in_process_evaluation() {
    let queries = [
        json!([{"name": "Ann"}]),
        json!([{"name": "Ann"}, {"id": 3}]),
        json!([{"id": [">", 1, "<=", 4]}]),
        json!([{"name": ["lower", "==", "ann"]}]),
        json!([{"name": ["==", "Ann", "failed"]}]),
        json!([{"name": ["~=", "^A"]}]),
        json!([{"id": [">", 2], "name": ["match", "b"]}]),
        json!([{"nickname": "Bobby"}]),
        json!([{"createdAt": [">=", 1_700_000_000_000i64]}]),
        json!([{"name": ["length", ">", 2, "||", "<", "B"]}]),
        json!([{"id": ["abs", "round", 0, "==", 5]}]),
        json!([{"flow": "error"}]),
        json!([{"id": ["round", "==", 3]}]),
        json!([{"createdAt": ["==", "1700000000000"]}]),
        json!([{"name": [">", 1000]}]),
    ];

    for value in queries {
        let q = query(value.clone());
        let (all, delivered) = fetch_from_full_table(&q).await;
        let expected: Vec<Record> = all.iter().filter(|r| q.matches(r)).cloned().collect();
        assert_eq!(delivered, expected, "query {value}");
    }
}

#[tokio::test]
async fn test_case_sensitive_equality() {
    let (_, delivered) = fetch_from_full_table(&query(json!([{"name": "Ann"}]))).await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0]["id"], 1);
}

#[test]
fn test_unsupported_parts_never_reach_sql() {
    let binding = users_binding();
    let cases = [
        (json!([{"name": ["~=", "^A"]}]), ""),
        (
            json!([{"id": [">", 2], "name": ["match", "b"]}]),
            "\n\n  WHERE ( `id` > 2 )",
        ),
        (json!([{"id": 1}, {"nickname": "Bobby"}]), ""),
        (
            json!([{"id": 1, "name": ["==", "A", "||", "~=", "B"]}]),
            "\n\n  WHERE ( `id` = 1 )",
        ),
    ];

    for (value, expected) in cases {
        assert_eq!(where_clause(&query(value.clone()), &binding), expected, "query {value}");
    }
}

/// Rows kept in-process where MySQL would evaluate the condition
/// differently: the condition must stay out of SQL.
#[test]
fn test_diverging_conditions_stay_out_of_sql() {
    let binding = users_binding();
    let cases = [
        // MySQL rounds DOUBLE 2.5 to 2
        (json!([{"id": ["round", "==", 3]}]), json!({"id": 2.5})),
        // and DECIMAL 1.005 to 1.01
        (json!([{"id": ["round", 2, "==", 1]}]), json!({"id": "1.005"})),
        // a storage-form string compares as text, not as a time
        (
            json!([{"createdAt": ["==", "1700000000000"]}]),
            json!({"createdAt": 1_700_000_000_000i64}),
        ),
        (
            json!([{"createdAt": [">", "1699999999999"]}]),
            json!({"createdAt": 1_700_000_000_000i64}),
        ),
    ];

    for (value, row) in cases {
        let q = query(value.clone());
        let row: Record = row.as_object().cloned().unwrap();
        assert!(q.matches(&row), "query {value}");
        assert_eq!(where_clause(&q, &binding), "", "query {value}");
    }
}

#[test]
fn test_non_finite_strings_are_not_numbers() {
    let binding = users_binding();
    let q = query(json!([{"name": [">", 1000]}]));
    for name in ["inf", "Infinity", "NaN", "1e400"] {
        let row: Record = json!({"name": name}).as_object().cloned().unwrap();
        // MySQL reads these as 0 or a finite number.
        assert!(!q.matches(&row), "name {name}");
    }
    assert_eq!(where_clause(&q, &binding), "\n\n  WHERE ( `name` > 1000 )");
}

#[test]
fn test_converted_columns_compare_in_storage_form() {
    let binding = users_binding();
    assert_eq!(
        where_clause(
            &query(json!([{"createdAt": [">=", 1_700_000_000_000i64, "<", 1_704_067_200_000i64]}])),
            &binding
        ),
        "\n\n  WHERE ( ( `created_at` >= '2023-11-14 22:13:20.000' ) AND ( `created_at` < '2024-01-01 00:00:00.000' ) )"
    );
}

#[test]
fn test_literals_are_escaped() {
    let binding = users_binding();
    assert_eq!(
        where_clause(&query(json!([{"name": "O'Brien\\"}])), &binding),
        "\n\n  WHERE ( `name` = 'O\\'Brien\\\\' )"
    );
}
