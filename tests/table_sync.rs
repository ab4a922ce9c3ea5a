//! Table synchronizer tests against the in-memory driver
//!
//! These follow one `users` table through adds, updates, removes and fetches,
//! checking the SQL that reaches the database and what is emitted downstream.

use mysql_async::consts::ColumnType;
use mysql_async::Value as MySqlValue;
use mysql_table_sync::config::{ConnectionOptions, ReconnectPolicy};
use mysql_table_sync::driver::ColumnMeta;
use mysql_table_sync::testing::{users_binding, FakeDriver};
use mysql_table_sync::{
    ConnectionManager, Emission, ErrorCode, ResultSet, StorageError, TableSync,
};
use serde_json::{json, Value};
use std::sync::Arc;
use sync_core::{Operation, Options, Query, Record, Update};
use tokio::sync::mpsc::UnboundedReceiver;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter("mysql_table_sync=debug")
        .try_init()
        .ok();
}

fn rec(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

async fn connected_sync(driver: &FakeDriver) -> (TableSync, UnboundedReceiver<Emission>) {
    let manager = ConnectionManager::new(
        Arc::new(driver.clone()),
        ConnectionOptions::default(),
        ReconnectPolicy::default(),
    );
    manager.add("root", ConnectionOptions::default()).await;
    manager
        .subscribe()
        .wait_for(Option::is_some)
        .await
        .expect("manager alive");

    TableSync::new(users_binding(), manager, 64)
}

fn users_result(rows: Vec<Vec<MySqlValue>>) -> ResultSet {
    ResultSet {
        columns: vec![
            ColumnMeta::new("id", ColumnType::MYSQL_TYPE_LONG),
            ColumnMeta::new("name", ColumnType::MYSQL_TYPE_VAR_STRING),
            ColumnMeta::new("createdAt", ColumnType::MYSQL_TYPE_DATETIME),
        ],
        rows,
    }
}

#[tokio::test]
async fn test_users_scenario() {
    init_logging();
    let driver = FakeDriver::new();
    let (sync, mut emissions) = connected_sync(&driver).await;

    // add: undeclared attributes dropped, missing ones confirmed as null
    sync.add(
        vec![rec(json!({"id": 1, "name": "Ann", "nickname": "A"}))],
        Options::default(),
    )
    .await
    .unwrap();
    let added = emissions.recv().await.unwrap();
    assert_eq!(
        added,
        Emission::Added {
            values: vec![rec(json!({"id": 1, "name": "Ann", "createdAt": null}))],
            options: Options::default(),
        }
    );

    // fetch by name: the stored row comes back equal to the confirmation
    driver.push_result(users_result(vec![vec![
        MySqlValue::Bytes(b"1".to_vec()),
        MySqlValue::Bytes(b"Ann".to_vec()),
        MySqlValue::NULL,
    ]]));
    let rows = sync
        .fetch_all(Some(Query::equals("name", "Ann")))
        .await
        .unwrap();
    let Emission::Added { values, .. } = added else {
        unreachable!()
    };
    assert_eq!(rows, values);

    // update name, then remove
    sync.update(
        vec![Update::new(
            rec(json!({"id": 1, "name": "Ann"})),
            rec(json!({"id": 1, "name": "Anna"})),
        )],
        Options::default(),
    )
    .await
    .unwrap();
    assert!(matches!(emissions.recv().await, Some(Emission::Updated { ref updates, .. }) if updates.len() == 1));

    sync.remove(vec![rec(json!({"id": 1, "name": "Anna"}))], Options::default())
        .await
        .unwrap();
    assert_eq!(
        emissions.recv().await.unwrap(),
        Emission::Removed {
            values: vec![rec(json!({"id": 1, "name": "Anna"}))],
            options: Options::default(),
        }
    );

    assert_eq!(
        driver.executed(),
        vec![
            "INSERT `users`\n\n    ( `id`, `name`, `created_at` )\n\n  VALUES\n\n    ( 1, 'Ann', NULL )",
            "  SELECT `id`\n       , `name`\n       , `created_at` AS `createdAt`\n\n  FROM `users`\n\n  WHERE ( `name` = 'Ann' )",
            "UPDATE `users`\n\n  SET `name` = 'Anna'\n\n  WHERE `id` = 1",
            "DELETE FROM `users`\n\n  WHERE `id` IN ( 1 )",
        ]
    );
}

#[tokio::test]
async fn test_missing_key_issues_no_sql() {
    init_logging();
    let driver = FakeDriver::new();
    let (sync, mut emissions) = connected_sync(&driver).await;
    let options = Options::from_sender("session-42");

    sync.add(
        vec![rec(json!({"id": 1})), rec(json!({"name": "Bob", "flow": "users"}))],
        options.clone(),
    )
    .await
    .unwrap();
    sync.remove(vec![rec(json!({"id": null}))], options.clone())
        .await
        .unwrap();
    sync.update(
        vec![Update::new(rec(json!({"name": "x"})), rec(json!({"id": 1, "name": "y"})))],
        options.clone(),
    )
    .await
    .unwrap();
    sync.flush().await.unwrap();

    let mut operations = Vec::new();
    for _ in 0..3 {
        let Some(Emission::Error { error, options: emitted }) = emissions.recv().await else {
            panic!("expected an error record");
        };
        assert_eq!(error.code, ErrorCode::NullKeyAttribute);
        assert_eq!(error.attribute.as_deref(), Some("id"));
        assert_eq!(error.sender.as_deref(), Some("session-42"));
        assert_eq!(emitted, options);
        operations.push(error.operation);
    }

    assert_eq!(
        operations,
        vec![Operation::Add, Operation::Remove, Operation::Update]
    );
    assert!(driver.executed().is_empty());
}

#[tokio::test]
async fn test_missing_key_position_and_value() {
    let driver = FakeDriver::new();
    let (sync, mut emissions) = connected_sync(&driver).await;

    sync.add(
        vec![rec(json!({"id": 1})), rec(json!({"name": "Bob"}))],
        Options::default(),
    )
    .await
    .unwrap();

    let Some(Emission::Error { error, .. }) = emissions.recv().await else {
        panic!("expected an error record");
    };
    let record = error.to_record();
    assert_eq!(record["position"], 1);
    assert_eq!(record["error_value"], json!({"name": "Bob"}));
    assert_eq!(record["values"], json!([{"id": 1}, {"name": "Bob"}]));
    assert_eq!(record["flow"], "error");
}

#[tokio::test]
async fn test_noop_update_issues_no_sql() {
    let driver = FakeDriver::new();
    let (sync, mut emissions) = connected_sync(&driver).await;
    let value = rec(json!({"id": 5, "name": "Eve", "createdAt": 1_700_000_000_000i64}));

    sync.update(
        vec![Update::new(value.clone(), value.clone())],
        Options::default(),
    )
    .await
    .unwrap();

    assert_eq!(
        emissions.recv().await.unwrap(),
        Emission::Updated {
            updates: vec![Update::new(value.clone(), value)],
            options: Options::default(),
        }
    );
    assert!(driver.executed().is_empty());
}

#[tokio::test]
async fn test_duplicate_key_reported_to_sender() {
    let driver = FakeDriver::new();
    let (sync, mut emissions) = connected_sync(&driver).await;
    driver.fail_statements([StorageError::new(
        "ER_DUP_ENTRY",
        "Duplicate entry '1' for key 'PRIMARY'",
    )
    .with_errno(1062)
    .with_sql_state("23000")]);

    sync.add(
        vec![rec(json!({"id": 1, "name": "Ann", "flow": "users"}))],
        Options::from_sender("session-1"),
    )
    .await
    .unwrap();

    let Some(Emission::Error { error, .. }) = emissions.recv().await else {
        panic!("expected an error record");
    };
    let record = error.to_record();
    assert_eq!(record["code"], "STORAGE_ERROR");
    assert_eq!(record["engine"], "mysql");
    assert_eq!(record["table"], "users");
    assert_eq!(record["storage_code"], "ER_DUP_ENTRY");
    assert_eq!(record["storage_errno"], 1062);
    assert_eq!(record["storage_sqlstate"], "23000");
    assert_eq!(record["operation"], "add");
    assert_eq!(record["sender"], "session-1");
    assert_eq!(record["error_flow"], "users");
    assert!(record["sql"].as_str().unwrap().starts_with("INSERT `users`"));

    // The next batch is unaffected.
    sync.add(vec![rec(json!({"id": 2}))], Options::default())
        .await
        .unwrap();
    assert!(matches!(emissions.recv().await, Some(Emission::Added { .. })));
}

#[tokio::test]
async fn test_invalid_value_rejected() {
    let driver = FakeDriver::new();
    let (sync, mut emissions) = connected_sync(&driver).await;

    sync.add(
        vec![rec(json!({"id": 1, "createdAt": {"at": "noon"}}))],
        Options::default(),
    )
    .await
    .unwrap();

    let Some(Emission::Error { error, .. }) = emissions.recv().await else {
        panic!("expected an error record");
    };
    assert_eq!(error.code, ErrorCode::InvalidValue);
    assert_eq!(error.attribute.as_deref(), Some("createdAt"));
    assert!(driver.executed().is_empty());
}
